// Pure merge rules between local catalog entries and one service's records.
// Nothing here touches disk; the engine applies the results per entry.

use std::collections::HashSet;

use chrono::{DateTime, Utc};

use super::service::{GameEntryDelta, RemoteGameRecord, ServiceCapabilities, SyncField};
use crate::core::catalog::{GameEntry, GameSource};

/// Where a pulled record lands locally.
#[derive(Debug, Clone, PartialEq)]
pub enum Correlation {
    Existing {
        local_id: String,
        record: RemoteGameRecord,
    },
    New(RemoteGameRecord),
}

/// Match records to local entries: first by this service's id, then by the
/// same id recorded under any other service. Each local entry takes at most
/// one record.
pub fn correlate(
    service: &str,
    local: &[GameEntry],
    remote: Vec<RemoteGameRecord>,
) -> Vec<Correlation> {
    let mut claimed: HashSet<&str> = HashSet::new();
    let mut out = Vec::with_capacity(remote.len());

    for record in remote {
        let exact = local.iter().find(|e| {
            !claimed.contains(e.id.as_str()) && e.external_id(service) == Some(&record.external_id)
        });
        let matched = exact.or_else(|| {
            local.iter().find(|e| {
                !claimed.contains(e.id.as_str())
                    && e.external_id(service).is_none()
                    && e.has_external_id(&record.external_id)
            })
        });
        match matched {
            Some(entry) => {
                claimed.insert(entry.id.as_str());
                out.push(Correlation::Existing {
                    local_id: entry.id.clone(),
                    record,
                });
            }
            None => out.push(Correlation::New(record)),
        }
    }
    out
}

/// Fold a remote record into a local entry. Returns whether it changed.
///
/// Playtime only grows, categories are unioned, the hidden flag follows the
/// newer timestamp with ties going to the local value. The install path and
/// title are never taken from a service for an existing entry.
pub fn merge_remote(
    entry: &mut GameEntry,
    service: &str,
    record: &RemoteGameRecord,
    caps: &ServiceCapabilities,
) -> bool {
    let mut changed = false;

    if entry.external_id(service) != Some(record.external_id.as_str()) {
        entry
            .external_ids
            .insert(service.to_string(), record.external_id.clone());
        changed = true;
    }

    if caps.supports(SyncField::Playtime) {
        if let Some(total) = record.playtime_secs {
            changed |= entry.observe_service_playtime(service, total);
        }
    }

    if caps.supports(SyncField::Categories) {
        if let Some(categories) = &record.categories {
            for category in categories {
                changed |= entry.categories.insert(category.clone());
            }
        }
    }

    if caps.supports(SyncField::Hidden) {
        if let Some(hidden) = record.hidden {
            let remote_at = record.hidden_clock();
            if hidden != entry.hidden && remote_at > entry.hidden_changed_at {
                entry.set_hidden(hidden, remote_at);
                changed = true;
            }
        }
    }

    if caps.supports(SyncField::LastPlayed) {
        if let Some(played) = record.last_played {
            if entry.last_played.map_or(true, |local| played > local) {
                entry.last_played = Some(played);
                changed = true;
            }
        }
    }

    changed
}

/// A fresh entry for a title only the service knows. It is not installed.
pub fn entry_from_remote(
    service: &str,
    record: &RemoteGameRecord,
    caps: &ServiceCapabilities,
) -> GameEntry {
    let mut entry = GameEntry::new(record.title.clone(), GameSource::Service(service.to_string()));
    // the remote clock is the only history this entry has
    entry.hidden_changed_at = DateTime::<Utc>::MIN_UTC;
    merge_remote(&mut entry, service, record, caps);
    entry
}

/// What, if anything, to push for `entry` after merging.
///
/// `record` is the matching record from this pull. Titles the service has
/// never seen are always queued; known titles are queued when the service
/// is missing local data, or when the entry changed locally since `since`
/// without the service reporting it.
pub fn outbound_delta(
    entry: &GameEntry,
    service: &str,
    record: Option<&RemoteGameRecord>,
    caps: &ServiceCapabilities,
    since: Option<DateTime<Utc>>,
) -> Option<GameEntryDelta> {
    if !caps.push {
        return None;
    }
    let delta = GameEntryDelta::for_entry(entry, service, caps);
    if entry.external_id(service).is_none() {
        return Some(delta);
    }

    let wanted = match record {
        Some(record) => remote_is_behind(entry, record, caps),
        None => since.map_or(false, |since| entry.last_modified > since),
    };
    wanted.then_some(delta)
}

fn remote_is_behind(entry: &GameEntry, record: &RemoteGameRecord, caps: &ServiceCapabilities) -> bool {
    if caps.supports(SyncField::Playtime) && record.playtime_secs.unwrap_or(0) < entry.playtime_secs {
        return true;
    }
    if caps.supports(SyncField::Categories) {
        let missing = match &record.categories {
            Some(remote) => !entry.categories.is_subset(remote),
            None => !entry.categories.is_empty(),
        };
        if missing {
            return true;
        }
    }
    if caps.supports(SyncField::Hidden) && record.hidden != Some(entry.hidden) {
        return true;
    }
    false
}
