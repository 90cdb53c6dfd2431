mod model;
mod store;

pub use model::{sort_title_for, GameEntry, GameSource, RecipeRef, FAVORITE_CATEGORY};
pub use store::CatalogStore;
