use std::sync::Arc;
use workstation_model::config::AppConfig;
use workstation_model::logic::{
    CompositeCommand, ModelEventListener, ModifyObserver, RenameEntityCommand,
    SetAttributeValueCommand,
};
use workstation_model::{build_model_mgr, CommandKind, ModelEvent, RootedEntity};

struct ConsoleObserver;

impl ModifyObserver for ConsoleObserver {
    fn note_can_undo(&self, command_name: &str) {
        println!("  [menu] Undo {}", command_name);
    }

    fn note_can_redo(&self, command_name: &str) {
        println!("  [menu] Redo {}", command_name);
    }

    fn note_command_did_finish(&self, command_name: &str, kind: CommandKind) {
        println!("  [status] {} {} finished", kind, command_name);
    }
}

impl ModelEventListener for ConsoleObserver {
    fn on_event(&self, event: &ModelEvent) {
        println!("  [event] {} {:?}", event.kind(), event.entity_ids());
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load environment variables from .env file if it exists
    dotenvy::dotenv().ok();

    let config = AppConfig::load()?;

    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(config.log_filter()))
        .init();

    println!("Workstation model demo");
    println!(
        "Configuration loaded: subject={}, cache capacity={}",
        config.facade.subject, config.model.cache_capacity
    );

    let mgr = build_model_mgr(&config)?;
    let observer = Arc::new(ConsoleObserver);
    mgr.modify_mgr().add_observer(observer.clone());
    mgr.register_on_event_bus(observer);

    let model = mgr.entity_model();

    for workspace in model.get_workspaces().await? {
        let rooted = RootedEntity::new(workspace);
        println!("Workspace {}", rooted.entity().identify());
        for child in rooted.children() {
            println!("  {} {}", child.unique_id(), child.entity().identify());
        }
    }
    mgr.flush().await;

    let Some(folder) = model.get_owned_common_root_by_name("My Data").await? else {
        println!("No common root named 'My Data'");
        return Ok(());
    };

    println!("Renaming {}", folder.identify());
    mgr.do_command(Box::new(RenameEntityCommand::new(
        Arc::clone(model),
        folder.id(),
        "My Images",
    )))
    .await?;
    mgr.flush().await;
    println!("Now {}", folder.identify());

    let batch = CompositeCommand::new(
        "Annotate",
        vec![
            Box::new(SetAttributeValueCommand::new(Arc::clone(model), folder.id(), "Description", "Imaging run 1")),
            Box::new(RenameEntityCommand::new(Arc::clone(model), folder.id(), "Run 1")),
        ],
    );
    mgr.do_command(Box::new(batch)).await?;
    mgr.flush().await;

    println!("Undo");
    mgr.undo().await?;
    mgr.flush().await;
    println!("Undo");
    mgr.undo().await?;
    mgr.flush().await;
    println!("Redo");
    mgr.redo().await?;
    mgr.flush().await;

    if let Some(current) = model.get_entity_by_id(folder.id()).await? {
        println!("Finally {}", current.identify());
    }

    println!("Command history:");
    for entry in mgr.modify_mgr().command_history() {
        println!("  {} {}", entry.at.format("%H:%M:%S%.3f"), entry.line());
    }

    Ok(())
}
