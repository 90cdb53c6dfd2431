mod common;

use common::{component, harness};
use waystone::core::cancel::CancelToken;
use waystone::core::runtime::Requirement;
use waystone::EngineError;

#[tokio::test]
async fn unreachable_index_falls_back_to_cached_listing() {
    let h = harness().await;
    h.index.publish(component("wine", "8.21", b"wine"));
    let host = h.engine.host.clone();
    let wanted: Requirement = Requirement::latest("wine");

    let online = h.engine.resolver.resolve(&wanted, &host).await.unwrap();
    assert!(!online.stale);

    h.index.set_offline(true);
    let offline = h.engine.resolver.resolve(&wanted, &host).await.unwrap();
    assert!(offline.stale);
    assert_eq!(offline.component.version, "8.21");
}

#[tokio::test]
async fn unreachable_index_without_cache_is_unresolved() {
    let h = harness().await;
    h.index.set_offline(true);
    let err = h
        .engine
        .resolver
        .resolve(&Requirement::latest("wine"), &h.engine.host)
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::Unresolved(_)));
}

#[tokio::test]
async fn cached_component_is_never_fetched_again() {
    let h = harness().await;
    let payload = b"proton build".to_vec();
    let proton = component("proton", "9.0-2", &payload);
    h.cdn.serve(&proton.url, payload);
    h.index.publish(proton);
    let wanted = Requirement::latest("proton");

    let first = h.engine.resolver.resolve(&wanted, &h.engine.host).await.unwrap();
    assert!(!first.is_cached());
    h.engine
        .resolver
        .materialize(&first, &CancelToken::new())
        .await
        .unwrap();
    assert_eq!(h.cdn.calls(), 1);

    let second = h.engine.resolver.resolve(&wanted, &h.engine.host).await.unwrap();
    assert!(second.is_cached());
    h.engine
        .resolver
        .materialize(&second, &CancelToken::new())
        .await
        .unwrap();
    assert_eq!(h.cdn.calls(), 1);
}
