use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use workstation_model::config::ModelConfig;
use workstation_model::logic::{RenameEntityCommand, UiDispatcher};
use workstation_model::{
    sample_seed, CommandKind, ModelEvent, ModelEventListener, ModelMgr, ModifyObserver,
};

const SUBJECT: &str = "user:demo";

fn setup() -> ModelMgr {
    let _ = env_logger::builder().is_test(true).try_init();
    let facade = Arc::new(sample_seed(SUBJECT).into_facade(SUBJECT));
    ModelMgr::new(facade, &ModelConfig::default()).expect("start model manager")
}

/// Records every callback and whether it ran on the UI thread
struct Recorder {
    ui: Arc<UiDispatcher>,
    lines: Mutex<Vec<String>>,
    off_ui_thread: Mutex<usize>,
}

impl Recorder {
    fn new(mgr: &ModelMgr) -> Arc<Self> {
        Arc::new(Self {
            ui: Arc::clone(mgr.notifier().ui()),
            lines: Mutex::new(Vec::new()),
            off_ui_thread: Mutex::new(0),
        })
    }

    fn note(&self, line: String) {
        if !self.ui.is_dispatch_thread() {
            *self.off_ui_thread.lock() += 1;
        }
        self.lines.lock().push(line);
    }

    fn lines(&self) -> Vec<String> {
        self.lines.lock().clone()
    }
}

impl ModifyObserver for Recorder {
    fn note_can_undo(&self, command_name: &str) {
        self.note(format!("can undo {}", command_name));
    }

    fn note_no_redo(&self) {
        self.note("no redo".to_string());
    }

    fn note_command_did_start(&self, command_name: &str) {
        self.note(format!("started {}", command_name));
    }

    fn note_command_did_finish(&self, command_name: &str, kind: CommandKind) {
        self.note(format!("finished {} {}", kind, command_name));
    }

    fn note_history_non_empty(&self) {
        self.note("history".to_string());
    }
}

impl ModelEventListener for Recorder {
    fn on_event(&self, event: &ModelEvent) {
        self.note(format!("{} {:?}", event.kind(), event.entity_ids()));
    }
}

#[tokio::test]
async fn test_command_notifications_follow_model_events() {
    let mgr = setup();
    let recorder = Recorder::new(&mgr);
    mgr.modify_mgr().add_observer(recorder.clone());
    mgr.register_on_event_bus(recorder.clone());

    mgr.do_command(Box::new(RenameEntityCommand::new(
        Arc::clone(mgr.entity_model()),
        2,
        "Renamed",
    )))
    .await
    .unwrap();
    mgr.flush().await;

    assert_eq!(
        recorder.lines(),
        vec![
            "started Rename",
            "EntityChanged [2]",
            "finished Do Rename",
            "history",
            "can undo Rename",
            "no redo",
        ]
    );
    assert_eq!(*recorder.off_ui_thread.lock(), 0);
    println!("✓ Observers ran on the UI thread in posting order");
}

#[tokio::test]
async fn test_model_events_in_order() {
    let mgr = setup();
    let recorder = Recorder::new(&mgr);
    mgr.register_on_event_bus(recorder.clone());
    let model = mgr.entity_model();

    let folder = model.get_entity_and_children(2).await.unwrap().unwrap();
    model.rename_entity(&folder, "Renamed").await.unwrap();
    let created = model.create_entity("Image", "new.tif").await.unwrap();
    mgr.flush().await;

    let expected = vec![
        "EntityChildrenLoaded [2]".to_string(),
        "EntityChanged [2]".to_string(),
        format!("EntityCreated [{}]", created.id()),
    ];
    assert_eq!(recorder.lines(), expected);
    assert_eq!(*recorder.off_ui_thread.lock(), 0);
}

#[tokio::test]
async fn test_unregistered_listener_hears_nothing() {
    let mgr = setup();
    let recorder = Recorder::new(&mgr);
    let id = mgr.register_on_event_bus(recorder.clone());
    assert!(mgr.unregister_on_event_bus(id));
    assert!(!mgr.unregister_on_event_bus(id));

    let observer: Arc<dyn ModifyObserver> = recorder.clone();
    mgr.modify_mgr().add_observer(Arc::clone(&observer));
    mgr.modify_mgr().remove_observer(&observer);

    mgr.do_command(Box::new(RenameEntityCommand::new(
        Arc::clone(mgr.entity_model()),
        2,
        "Renamed",
    )))
    .await
    .unwrap();
    mgr.flush().await;

    assert!(recorder.lines().is_empty());
}

#[tokio::test]
async fn test_posted_events_reach_listeners() {
    let mgr = setup();
    let recorder = Recorder::new(&mgr);
    mgr.register_on_event_bus(recorder.clone());
    let (_, mut events) = mgr.event_bus().subscribe();

    let image = mgr.entity_model().get_entity_by_id(3).await.unwrap().unwrap();
    mgr.post_on_event_bus(ModelEvent::EntityChanged(image));
    mgr.flush().await;

    assert_eq!(recorder.lines(), vec!["EntityChanged [3]"]);
    let received = events.try_recv().unwrap();
    assert_eq!(received.entity_ids(), vec![3]);
}

#[tokio::test]
async fn test_worker_result_delivered_on_ui_thread() {
    let mgr = setup();
    let ui = Arc::clone(mgr.notifier().ui());
    let delivered = Arc::new(Mutex::new(None));

    let model = Arc::clone(mgr.entity_model());
    let sink = Arc::clone(&delivered);
    let handle = mgr.spawn_worker(
        "load-folder",
        async move { model.get_entity_and_children(2).await },
        move |result| {
            let names: Vec<String> = match result {
                Ok(Some(folder)) => {
                    let children = folder.read().ordered_children();
                    children.iter().map(|c| c.name()).collect()
                }
                _ => Vec::new(),
            };
            *sink.lock() = Some((names, ui.is_dispatch_thread()));
        },
    );
    handle.join().await;
    mgr.flush().await;

    let (names, on_ui) = delivered.lock().take().expect("worker delivered");
    assert_eq!(names, vec!["brain_scan_001.tif", "brain_scan_002.tif"]);
    assert!(on_ui);
}

#[tokio::test]
async fn test_cancelled_worker_never_delivers() {
    let mgr = setup();
    let delivered = Arc::new(Mutex::new(false));

    let sink = Arc::clone(&delivered);
    let handle = mgr.spawn_worker(
        "slow",
        async {
            tokio::time::sleep(Duration::from_secs(30)).await;
            42
        },
        move |_| *sink.lock() = true,
    );
    handle.cancel();
    assert!(handle.is_cancelled());
    handle.join().await;
    mgr.flush().await;

    assert!(!*delivered.lock());
}

#[tokio::test]
async fn test_panicking_task_does_not_stop_delivery() {
    let mgr = setup();
    let recorder = Recorder::new(&mgr);
    mgr.register_on_event_bus(recorder.clone());

    mgr.notifier()
        .ui()
        .invoke_later(Box::new(|| panic!("listener failure")));
    let image = mgr.entity_model().get_entity_by_id(3).await.unwrap().unwrap();
    mgr.post_on_event_bus(ModelEvent::EntityChildrenLoaded(image));
    mgr.flush().await;

    assert_eq!(recorder.lines(), vec!["EntityChildrenLoaded [3]"]);
}
