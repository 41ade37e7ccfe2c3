//! Contention tests over the in-memory store: capacity pools never overbook,
//! a pending request is decided at most once, and chest numbers stay unique.

use sabha_core::{
    Actor, ChangeProposal, EntityKind, EventConfig, EventKind, MemoryStore, PoolScope,
    RegistryEngine, RegistryStore, RequestKind, RequestStatus, SabhaError, TargetRef,
};
use serde_json::json;
use std::collections::HashSet;
use std::sync::Arc;
use uuid::Uuid;

fn engine() -> (Arc<RegistryEngine>, Arc<MemoryStore>) {
    let store = Arc::new(MemoryStore::new());
    (Arc::new(RegistryEngine::new(store.clone())), store)
}

#[tokio::test(flavor = "multi_thread", worker_threads = 8)]
async fn concurrent_reserves_never_exceed_the_pool_bound() {
    let (_, store) = engine();
    let scope = PoolScope::EventTotal {
        event_id: Uuid::new_v4(),
    };
    store.ensure_pool(&scope, 0, 5).await.unwrap();

    let mut handles = Vec::new();
    for _ in 0..20 {
        let store = store.clone();
        handles.push(tokio::spawn(async move { store.reserve(&scope, 1).await }));
    }

    let mut committed = 0;
    for handle in handles {
        match handle.await.unwrap() {
            Ok(_) => committed += 1,
            Err(SabhaError::CapacityExceeded { .. }) => {}
            Err(other) => panic!("unexpected error: {other}"),
        }
    }

    assert_eq!(committed, 5);
    let pool = store.fetch_pool(&scope).await.unwrap().unwrap();
    assert_eq!(pool.current_count, 5);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 8)]
async fn a_pending_request_is_decided_exactly_once() {
    let (engine, store) = engine();
    let target = TargetRef::new(EntityKind::Member, Uuid::new_v4());
    store.seed_target(
        target,
        [("name".to_string(), json!("ORIGINAL"))].into_iter().collect(),
    );

    let request = engine
        .propose_change(
            &Actor::unit("unit-1"),
            ChangeProposal {
                kind: RequestKind::MemberInfoChange,
                target: Some(target),
                proposed: [("name".to_string(), json!("CHANGED"))]
                    .into_iter()
                    .collect(),
                capacity_demand: None,
                reason: "contended decision test".to_string(),
                proof_reference: None,
            },
        )
        .await
        .unwrap();

    let mut handles = Vec::new();
    for i in 0..10 {
        let engine = engine.clone();
        let admin = Actor::admin(format!("admin-{i}"));
        let id = request.id;
        handles.push(tokio::spawn(async move {
            if i % 2 == 0 {
                engine.approve_change(&admin, id).await
            } else {
                engine.reject_change(&admin, id).await
            }
        }));
    }

    let mut decisions = 0;
    for handle in handles {
        match handle.await.unwrap() {
            Ok(_) => decisions += 1,
            Err(SabhaError::InvalidState { .. }) => {}
            Err(other) => panic!("unexpected error: {other}"),
        }
    }
    assert_eq!(decisions, 1);

    let decided = store.fetch_request(request.id).await.unwrap();
    assert!(matches!(
        decided.status,
        RequestStatus::Approved | RequestStatus::Rejected
    ));
    // The field reflects the single decision, whichever way it went.
    let name = store.read_fields(&target, &[]).await.unwrap();
    match decided.status {
        RequestStatus::Approved => assert_eq!(name.get("name"), Some(&json!("CHANGED"))),
        _ => assert_eq!(name.get("name"), Some(&json!("ORIGINAL"))),
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 8)]
async fn concurrent_registrations_get_unique_chest_numbers() {
    let (engine, _) = engine();
    let event = EventConfig {
        id: Uuid::new_v4(),
        name: "Cartoon Drawing".to_string(),
        kind: EventKind::Individual,
        max_allowed_limit: 100,
        per_unit_allowed_limit: 2,
    };
    let district_id = Uuid::new_v4();

    let mut handles = Vec::new();
    for _ in 0..20 {
        let engine = engine.clone();
        let event = event.clone();
        handles.push(tokio::spawn(async move {
            engine
                .register_individual(
                    &Actor::unit("unit-1"),
                    &event,
                    Uuid::new_v4(),
                    Uuid::new_v4(),
                    district_id,
                )
                .await
        }));
    }

    let mut chests = HashSet::new();
    for handle in handles {
        let participation = handle.await.unwrap().unwrap();
        assert!(
            chests.insert(participation.chest_number.clone()),
            "duplicate chest number {}",
            participation.chest_number
        );
    }
    assert_eq!(chests.len(), 20);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 8)]
async fn racing_first_team_batches_share_one_chest_and_one_slot() {
    let (engine, store) = engine();
    let event = EventConfig {
        id: Uuid::new_v4(),
        name: "Group Song (Malayalam)".to_string(),
        kind: EventKind::Group,
        max_allowed_limit: 100,
        per_unit_allowed_limit: 20,
    };
    let unit_id = Uuid::new_v4();
    let district_id = Uuid::new_v4();

    let mut handles = Vec::new();
    for _ in 0..8 {
        let engine = engine.clone();
        let event = event.clone();
        handles.push(tokio::spawn(async move {
            engine
                .register_team(
                    &Actor::unit("unit-1"),
                    &event,
                    "TVM",
                    &[Uuid::new_v4()],
                    unit_id,
                    district_id,
                )
                .await
        }));
    }

    let mut chests = HashSet::new();
    for handle in handles {
        let batch = handle.await.unwrap().unwrap();
        for participation in batch {
            chests.insert(participation.chest_number);
        }
    }
    assert_eq!(chests.len(), 1, "every batch joined the same team");

    let teams = store
        .fetch_pool(&PoolScope::DistrictTeams {
            event_id: event.id,
            district_id,
        })
        .await
        .unwrap()
        .unwrap();
    assert_eq!(teams.current_count, 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 8)]
async fn per_unit_ceiling_holds_under_contention() {
    let (engine, store) = engine();
    let event = EventConfig {
        id: Uuid::new_v4(),
        name: "Pencil Drawing".to_string(),
        kind: EventKind::Individual,
        max_allowed_limit: 100,
        per_unit_allowed_limit: 2,
    };
    let unit_id = Uuid::new_v4();
    let district_id = Uuid::new_v4();

    let mut handles = Vec::new();
    for _ in 0..6 {
        let engine = engine.clone();
        let event = event.clone();
        handles.push(tokio::spawn(async move {
            engine
                .register_individual(
                    &Actor::unit("unit-1"),
                    &event,
                    Uuid::new_v4(),
                    unit_id,
                    district_id,
                )
                .await
        }));
    }

    let mut registered = 0;
    for handle in handles {
        match handle.await.unwrap() {
            Ok(_) => registered += 1,
            Err(SabhaError::CapacityExceeded { .. }) => {}
            Err(other) => panic!("unexpected error: {other}"),
        }
    }
    assert_eq!(registered, 2);

    let pool = store
        .fetch_pool(&PoolScope::UnitEvent {
            event_id: event.id,
            unit_id,
        })
        .await
        .unwrap()
        .unwrap();
    assert_eq!(pool.current_count, 2);
}
