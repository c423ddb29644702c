use std::sync::Arc;
use tokio::sync::mpsc::UnboundedReceiver;
use workstation_model::config::ModelConfig;
use workstation_model::store::EntityFacade;
use workstation_model::{
    attributes, entity_types, sample_seed, ChildRef, EntityHandle, EntityId, InMemoryFacade,
    ModelError, ModelEvent, ModelMgr, OntologyTermType,
};

const SUBJECT: &str = "user:demo";

fn setup(cache_capacity: usize) -> (Arc<InMemoryFacade>, ModelMgr) {
    let _ = env_logger::builder().is_test(true).try_init();
    let facade = Arc::new(sample_seed(SUBJECT).into_facade(SUBJECT));
    let config = ModelConfig {
        cache_capacity,
        dump_stacks: false,
    };
    let mgr = ModelMgr::new(facade.clone(), &config).expect("start model manager");
    (facade, mgr)
}

fn child_of(entity: &EntityHandle, child_id: EntityId) -> Option<ChildRef> {
    entity
        .read()
        .entity_data
        .iter()
        .find(|ed| ed.points_at(child_id))
        .and_then(|ed| ed.child.clone())
}

fn loaded_child(entity: &EntityHandle, child_id: EntityId) -> EntityHandle {
    match child_of(entity, child_id) {
        Some(ChildRef::Loaded(child)) => child,
        other => panic!("child {} of {:?} is not loaded: {:?}", child_id, entity, other),
    }
}

fn drain(events: &mut UnboundedReceiver<ModelEvent>) -> Vec<ModelEvent> {
    let mut drained = Vec::new();
    while let Ok(event) = events.try_recv() {
        drained.push(event);
    }
    drained
}

#[tokio::test]
async fn test_same_id_returns_identical_handle() {
    let (facade, mgr) = setup(100);
    let model = mgr.entity_model();

    let first = model.get_entity_by_id(2).await.unwrap().unwrap();
    let calls = facade.remote_calls();
    let second = model.get_entity_by_id(2).await.unwrap().unwrap();

    assert!(first.ptr_eq(&second));
    assert_eq!(facade.remote_calls(), calls, "second fetch is served from the cache");
    println!("✓ Two fetches of the same id return one instance");
}

#[tokio::test]
async fn test_missing_and_unreadable_entities() {
    let (_facade, mgr) = setup(100);
    let model = mgr.entity_model();

    assert!(model.get_entity_by_id(999).await.unwrap().is_none());
    assert!(model.get_entity_by_id(5).await.unwrap().is_none(), "private folder");
    assert!(!model.is_cached(5));
}

#[tokio::test]
async fn test_merge_updates_instance_in_place() {
    let (facade, mgr) = setup(100);
    let model = mgr.entity_model();
    let (_, mut events) = mgr.event_bus().subscribe();

    let folder = model.get_entity_and_children(2).await.unwrap().unwrap();
    let image = loaded_child(&folder, 3);
    mgr.flush().await;
    drain(&mut events);

    facade.rename_remote(3, "renamed_scan.tif");
    let reloaded = model.reload_by_id(3).await.unwrap().unwrap();

    assert!(reloaded.ptr_eq(&image), "reload keeps the canonical instance");
    assert_eq!(image.name(), "renamed_scan.tif");
    assert!(loaded_child(&folder, 3).ptr_eq(&image));

    mgr.flush().await;
    let changed: Vec<Vec<EntityId>> = drain(&mut events)
        .iter()
        .filter(|e| matches!(e, ModelEvent::EntityChanged(_)))
        .map(ModelEvent::entity_ids)
        .collect();
    assert_eq!(changed, vec![vec![3]]);
}

#[tokio::test]
async fn test_unchanged_reload_posts_no_change() {
    let (_facade, mgr) = setup(100);
    let model = mgr.entity_model();
    let (_, mut events) = mgr.event_bus().subscribe();

    model.get_entity_by_id(3).await.unwrap();
    model.reload_by_id(3).await.unwrap();
    mgr.flush().await;

    assert!(drain(&mut events)
        .iter()
        .all(|e| !matches!(e, ModelEvent::EntityChanged(_))));
}

#[tokio::test]
async fn test_unreadable_child_becomes_forbidden() {
    let (_facade, mgr) = setup(100);
    let model = mgr.entity_model();

    let shared = model.get_entity_and_children(4).await.unwrap().unwrap();

    assert!(matches!(child_of(&shared, 3), Some(ChildRef::Loaded(_))));
    assert!(matches!(child_of(&shared, 5), Some(ChildRef::Forbidden(5))));
    assert!(shared.read().children_loaded());
}

#[tokio::test]
async fn test_entity_tree_shares_canonical_instances() {
    let (_facade, mgr) = setup(100);
    let model = mgr.entity_model();

    let workspace = model.get_entity_tree(1).await.unwrap().unwrap();
    let my_data = loaded_child(&workspace, 2);
    let shared = loaded_child(&workspace, 4);

    let via_my_data = loaded_child(&my_data, 3);
    let via_shared = loaded_child(&shared, 3);
    assert!(via_my_data.ptr_eq(&via_shared), "one instance per id");
    assert!(via_my_data.ptr_eq(&model.get_if_cached(3).unwrap()));
    assert!(matches!(child_of(&shared, 5), Some(ChildRef::Forbidden(5))));
    assert_eq!(model.cached_parent_ids(3), vec![2, 4]);
}

#[tokio::test]
async fn test_get_entities_by_id_batches_misses() {
    let (facade, mgr) = setup(100);
    let model = mgr.entity_model();

    model.get_entity_by_id(2).await.unwrap();
    let calls = facade.remote_calls();
    let entities = model.get_entities_by_id(&[6, 2, 999, 3]).await.unwrap();

    let ids: Vec<EntityId> = entities.iter().map(EntityHandle::id).collect();
    assert_eq!(ids, vec![6, 2, 3]);
    assert_eq!(facade.remote_calls(), calls + 1);
}

#[tokio::test]
async fn test_load_lazy_entity_recursively() {
    let (_facade, mgr) = setup(100);
    let model = mgr.entity_model();

    let workspace = model.get_entity_by_id(1).await.unwrap().unwrap();
    assert!(!workspace.read().children_loaded());

    let loaded = model.load_lazy_entity(&workspace, true).await.unwrap();
    assert!(loaded.ptr_eq(&workspace));
    let my_data = loaded_child(&workspace, 2);
    assert!(my_data.read().children_loaded());
    assert!(loaded_child(&my_data, 6).read().children_loaded());
}

#[tokio::test]
async fn test_workspace_eviction_clears_root_cache() {
    let (facade, mgr) = setup(3);
    let model = mgr.entity_model();

    let workspaces = model.get_workspaces().await.unwrap();
    assert_eq!(workspaces.len(), 1);
    assert_eq!(model.cached_workspaces().len(), 1);
    assert_eq!(model.cached_parent_ids(2), vec![1]);

    // the workspace is the least recently used entry
    model.get_entity_by_id(3).await.unwrap();
    assert!(!model.is_cached(1));
    assert!(model.cached_workspaces().is_empty());

    // next victim is folder 2, whose parent index entry goes with it
    model.get_entity_by_id(6).await.unwrap();
    assert!(!model.is_cached(2));
    assert!(model.cached_parent_ids(2).is_empty());
    assert_eq!(model.cached_count(), 3);

    let calls = facade.remote_calls();
    let reloaded = model.get_workspaces().await.unwrap();
    assert_eq!(reloaded.len(), 1);
    assert!(facade.remote_calls() > calls, "workspaces are fetched again");
}

#[tokio::test]
async fn test_queries_return_canonical_instances() {
    let (_facade, mgr) = setup(100);
    let model = mgr.entity_model();

    let image = model.get_entity_by_id(3).await.unwrap().unwrap();

    let mut parents: Vec<EntityId> = model
        .get_parent_entities(3)
        .await
        .unwrap()
        .iter()
        .map(EntityHandle::id)
        .collect();
    parents.sort();
    assert_eq!(parents, vec![2, 4]);

    let edges = model.get_parent_entity_datas(3).await.unwrap();
    assert_eq!(edges.len(), 2);
    for edge in &edges {
        match &edge.child {
            Some(ChildRef::Loaded(child)) => assert!(child.ptr_eq(&image)),
            other => panic!("unexpected child {:?}", other),
        }
    }

    let workspace = model
        .get_ancestor_with_type(&image, entity_types::WORKSPACE)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(workspace.id(), 1);

    let images = model.get_entities_by_type_name("Image").await.unwrap();
    assert!(images.iter().any(|e| e.ptr_eq(&image)));

    let by_name = model.get_entities_by_name("My Data").await.unwrap();
    assert_eq!(by_name.len(), 1);
    assert_eq!(by_name[0].id(), 2);
}

#[tokio::test]
async fn test_refresh_children_larger_than_cache() {
    let _ = env_logger::builder().is_test(true).try_init();
    let facade = Arc::new(InMemoryFacade::new(SUBJECT));
    facade.add_entity(1, "Folder", entity_types::FOLDER);
    for id in 2..=4 {
        facade.add_entity(id, &format!("image_{}.tif", id), "Image");
        facade.link(1, id);
    }
    let config = ModelConfig {
        cache_capacity: 2,
        dump_stacks: false,
    };
    let mgr = ModelMgr::new(facade.clone(), &config).expect("start model manager");
    let model = mgr.entity_model();

    let folder = model.get_entity_by_id(1).await.unwrap().unwrap();
    model.refresh_children(&folder).await.unwrap();

    for id in 2..=4 {
        assert_eq!(loaded_child(&folder, id).id(), id, "readable child {} is loaded", id);
    }
    assert_eq!(folder.read().child_count(), 3);
    assert!(folder.read().children_loaded());
}

#[tokio::test]
async fn test_owned_queries_and_all_parent_edges() {
    let (facade, mgr) = setup(100);
    let model = mgr.entity_model();

    let folders = model.get_entities_by_type_name(entity_types::FOLDER).await.unwrap();
    assert_eq!(folders.len(), 2);
    let owned = model
        .get_owned_entities_by_type_name(entity_types::FOLDER)
        .await
        .unwrap();
    assert_eq!(owned.len(), 1);
    assert!(owned[0].ptr_eq(&model.get_if_cached(2).unwrap()));

    assert_eq!(model.get_entities_by_name("Shared Results").await.unwrap().len(), 1);
    assert!(model
        .get_owned_entities_by_name("Shared Results")
        .await
        .unwrap()
        .is_empty());

    // a folder the subject cannot read also links the image
    facade.add_entity_owned_by(20, "Hidden", entity_types::FOLDER, "user:colleague");
    facade.link(20, 3);
    let image = model.get_entity_by_id(3).await.unwrap().unwrap();

    assert_eq!(model.get_parent_entity_datas(3).await.unwrap().len(), 2);
    let all = model.get_all_parent_entity_datas(3).await.unwrap();
    let mut parents: Vec<EntityId> = all.iter().filter_map(|ed| ed.parent_id).collect();
    parents.sort_unstable();
    assert_eq!(parents, vec![2, 4, 20]);
    assert!(all
        .iter()
        .all(|ed| matches!(&ed.child, Some(ChildRef::Loaded(child)) if child.ptr_eq(&image))));
}

#[tokio::test]
async fn test_data_sets() {
    let (_facade, mgr) = setup(100);
    let model = mgr.entity_model();
    let (_, mut events) = mgr.event_bus().subscribe();

    let data_set = model.create_data_set("Brain Scans").await.unwrap();
    assert!(model.get_if_cached(data_set.id()).unwrap().ptr_eq(&data_set));
    assert_eq!(
        data_set
            .read()
            .value_by_attribute_name(attributes::DATA_SET_IDENTIFIER),
        Some("demo_brain_scans")
    );

    let data_sets = model.get_data_sets().await.unwrap();
    assert_eq!(data_sets.len(), 1);
    assert!(data_sets[0].ptr_eq(&data_set));

    let err = model.create_data_set("brain scans").await.unwrap_err();
    assert!(matches!(err, ModelError::Remote(_)));

    mgr.flush().await;
    let created: Vec<Vec<EntityId>> = drain(&mut events)
        .iter()
        .filter(|e| matches!(e, ModelEvent::EntityCreated(_)))
        .map(ModelEvent::entity_ids)
        .collect();
    assert_eq!(created, vec![vec![data_set.id()]]);
}

#[tokio::test]
async fn test_rename_keeps_forbidden_children() {
    let facade = Arc::new(InMemoryFacade::new(SUBJECT));
    facade.add_entity(20, "Mine", entity_types::FOLDER);
    facade.add_entity_owned_by(21, "Hidden", "Image", "user:other");
    facade.link(20, 21);
    let config = ModelConfig {
        cache_capacity: 100,
        dump_stacks: false,
    };
    let mgr = ModelMgr::new(facade.clone(), &config).unwrap();
    let model = mgr.entity_model();

    let folder = model.get_entity_and_children(20).await.unwrap().unwrap();
    assert!(matches!(child_of(&folder, 21), Some(ChildRef::Forbidden(21))));

    let renamed = model.rename_entity(&folder, "Renamed").await.unwrap();
    assert!(renamed.ptr_eq(&folder));
    assert_eq!(folder.name(), "Renamed");
    assert!(matches!(child_of(&folder, 21), Some(ChildRef::Forbidden(21))));
    assert_eq!(facade.edge_rows_of(20).len(), 1, "the hidden edge survives the save");
}

#[tokio::test]
async fn test_failed_remote_call_leaves_cache_unchanged() {
    let (facade, mgr) = setup(100);
    let model = mgr.entity_model();
    let folder = model.get_entity_by_id(2).await.unwrap().unwrap();

    facade.set_offline(true);
    let err = model.rename_entity(&folder, "Offline rename").await.unwrap_err();
    facade.set_offline(false);

    assert!(matches!(err, ModelError::Remote(_)));
    assert_eq!(folder.name(), "My Data");
    assert!(model.get_if_cached(2).unwrap().ptr_eq(&folder));
}

#[tokio::test]
async fn test_values_and_tags() {
    let (facade, mgr) = setup(100);
    let model = mgr.entity_model();
    let image = model.get_entity_by_id(3).await.unwrap().unwrap();

    let edge = model.set_or_update_value(&image, "Quality", "good").await.unwrap();
    assert_eq!(edge.value.as_deref(), Some("good"));
    // the new edge came with an invalidation, so read the current instance
    let image = model.get_entity_by_id(3).await.unwrap().unwrap();
    assert_eq!(image.read().value_by_attribute_name("Quality"), Some("good"));

    model.set_or_update_value(&image, "Quality", "bad").await.unwrap();
    assert_eq!(image.read().value_by_attribute_name("Quality"), Some("bad"));
    let row = facade
        .edge_rows_of(3)
        .into_iter()
        .find(|e| e.attribute_name == "Quality")
        .unwrap();
    assert_eq!(row.value.as_deref(), Some("bad"));

    let tagged = model.set_attribute_as_tag(&image, "Reviewed").await.unwrap();
    assert_eq!(tagged.read().value_by_attribute_name("Reviewed"), Some("Reviewed"));

    let others = vec![model.get_entity_by_id(6).await.unwrap().unwrap()];
    let saved = model.set_or_update_values(&others, "Quality", "good").await.unwrap();
    assert_eq!(saved.len(), 1);
}

#[tokio::test]
async fn test_add_and_reorder_children() {
    let (facade, mgr) = setup(100);
    let model = mgr.entity_model();
    let folder = model.get_entity_and_children(2).await.unwrap().unwrap();

    let image = model.create_entity("Image", "brain_scan_003.tif").await.unwrap();
    let edge = model.add_entity_to_parent_next(&folder, &image).await.unwrap();

    assert_eq!(edge.order_index, Some(2));
    assert!(loaded_child(&folder, image.id()).ptr_eq(&image));
    assert_eq!(model.cached_parent_ids(image.id()), vec![2]);
    assert_eq!(folder.read().num_children, Some(3));
    assert!(facade
        .edge_rows_of(2)
        .iter()
        .any(|e| e.child_id == Some(image.id())));

    let moved = model.update_child_index(&edge, 0).await.unwrap();
    assert_eq!(moved.order_index, Some(0));
    let cached_edge = folder
        .read()
        .entity_data
        .iter()
        .find(|ed| ed.id == edge.id)
        .cloned()
        .unwrap();
    assert_eq!(cached_edge.order_index, Some(0));

    model.update_child_indexes(&folder).await.unwrap();

    let mut saved = edge.clone();
    saved.order_index = Some(7);
    let saved = model.save_entity_data(&saved).await.unwrap();
    assert_eq!(saved.order_index, Some(7));
    assert!(matches!(saved.child, Some(ChildRef::Loaded(ref c)) if c.ptr_eq(&image)));

    let parent = model.add_children(1, &[6], attributes::ENTITY).await.unwrap().unwrap();
    assert!(parent.read().child_ids().contains(&6));
}

#[tokio::test]
async fn test_delete_entity_tree_strips_cached_parents() {
    let (facade, mgr) = setup(100);
    let model = mgr.entity_model();
    let folder = model.get_entity_and_children(2).await.unwrap().unwrap();
    let image = loaded_child(&folder, 6);
    let (_, mut events) = mgr.event_bus().subscribe();

    model.delete_entity_tree(&image).await.unwrap();
    mgr.flush().await;

    assert!(!model.is_cached(6));
    assert!(facade.entity_row(6).is_none());
    let folder = model.get_if_cached(2).unwrap();
    assert!(!folder.read().child_ids().contains(&6));

    let events = drain(&mut events);
    let removed = events
        .iter()
        .find_map(|e| match e {
            ModelEvent::EntityRemoved { entity, parent_edges } => Some((entity.id(), parent_edges.len())),
            _ => None,
        })
        .expect("removal event");
    assert_eq!(removed, (6, 1));
    assert!(events
        .iter()
        .any(|e| matches!(e, ModelEvent::EntityInvalidated(_)) && e.entity_ids() == vec![2]));
}

#[tokio::test]
async fn test_delete_entity_data() {
    let (facade, mgr) = setup(100);
    let model = mgr.entity_model();
    let folder = model.get_entity_and_children(2).await.unwrap().unwrap();
    let edge = folder
        .read()
        .entity_data
        .iter()
        .find(|ed| ed.points_at(3))
        .cloned()
        .unwrap();

    model.delete_entity_data(&edge).await.unwrap();

    let folder = model.get_if_cached(2).unwrap();
    assert!(!folder.read().child_ids().contains(&3));
    assert!(facade.edge_rows_of(2).iter().all(|e| e.child_id != Some(3)));

    let remaining: Vec<_> = folder
        .read()
        .entity_data
        .iter()
        .filter(|ed| ed.child.is_some())
        .cloned()
        .collect();
    model.delete_bulk_entity_data(&folder, &remaining).await.unwrap();
    let folder = model.get_if_cached(2).unwrap();
    assert_eq!(folder.read().child_count(), 0);
}

#[tokio::test]
async fn test_common_roots() {
    let (_facade, mgr) = setup(100);
    let model = mgr.entity_model();

    let roots = model.get_common_roots_by_name(1, "My Data").await.unwrap();
    assert_eq!(roots.len(), 1);
    let owned = model.get_owned_common_root_by_name("My Data").await.unwrap().unwrap();
    assert!(owned.ptr_eq(&roots[0]));
    assert!(model
        .get_owned_common_root_by_name("Shared Results")
        .await
        .unwrap()
        .is_none(), "owned by someone else");

    let created = model.create_common_root_folder(1, "New Results").await.unwrap();
    assert!(created
        .read()
        .entity_data_by_attribute_name(attributes::COMMON_ROOT)
        .is_some());
    let workspace = model.get_entity_and_children(1).await.unwrap().unwrap();
    assert!(workspace.read().child_ids().contains(&created.id()));

    let demoted = model.demote_common_root_to_folder(&created).await.unwrap();
    assert!(demoted
        .read()
        .entity_data_by_attribute_name(attributes::COMMON_ROOT)
        .is_none());

    let plain = model.get_entity_by_id(6).await.unwrap().unwrap();
    assert!(matches!(
        model.demote_common_root_to_folder(&plain).await,
        Err(ModelError::InvalidArgument(_))
    ));
}

#[tokio::test]
async fn test_ontology_roots_and_terms() {
    let (facade, mgr) = setup(100);
    let model = mgr.entity_model();

    let roots = model.get_ontology_roots().await.unwrap();
    assert_eq!(roots.len(), 1);
    let quality = loaded_child(&roots[0], 11);
    assert_eq!(quality.read().child_count(), 2);

    let calls = facade.remote_calls();
    model.get_ontology_roots().await.unwrap();
    assert_eq!(facade.remote_calls(), calls, "ontology roots are cached");

    let term = model
        .create_ontology_term(11, "Unsure", OntologyTermType::EnumItem, None)
        .await
        .unwrap();
    assert_eq!(term.name(), "Unsure");
    assert!(loaded_child(&quality, term.id()).ptr_eq(&term));
    assert_eq!(
        term.read().value_by_attribute_name(attributes::ONTOLOGY_TERM_TYPE),
        Some("EnumItem")
    );

    let root = model.get_ontology_root("Annotation Terms").await.unwrap();
    assert!(root.unwrap().ptr_eq(&roots[0]));

    let created = model.create_ontology_root("Behaviour").await.unwrap();
    assert!(model.get_ontology_roots().await.unwrap().iter().any(|r| r.ptr_eq(&created)));
    assert!(facade.get_entity_by_id(created.id()).await.unwrap().is_some());
}
