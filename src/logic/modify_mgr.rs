//! Undo/redo command stack.
//!
//! Commands run through [`ModifyMgr::do_command`]; the inverse each one returns
//! is kept on the undo list, and undoing it yields the redo entry. Observers are
//! told about every state change through the notification queue.

use chrono::{DateTime, Utc};
use log::debug;
use parking_lot::{Mutex, RwLock};
use std::collections::VecDeque;
use std::sync::Arc;

use crate::error::CommandError;
use crate::logic::command::{Command, CommandKind};
use crate::logic::model_mgr::handle_error;
use crate::logic::notification::Notifier;

/// Callbacks run on the UI thread. Every method defaults to doing nothing.
pub trait ModifyObserver: Send + Sync {
    fn note_can_undo(&self, _command_name: &str) {}
    fn note_can_redo(&self, _command_name: &str) {}
    fn note_no_undo(&self) {}
    fn note_no_redo(&self) {}
    fn note_command_did_start(&self, _command_name: &str) {}
    fn note_command_did_finish(&self, _command_name: &str, _kind: CommandKind) {}
    fn note_command_precondition_failed(&self, _command_name: &str) {}
    fn note_command_execution_failed(&self, _command_name: &str) {}
    fn note_command_postcondition_failed(&self, _command_name: &str) {}
    fn note_history_non_empty(&self) {}
    fn note_history_empty(&self) {}
}

/// A state change of the command stack
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ModifyNotification {
    CanUndo(String),
    CanRedo(String),
    NoUndo,
    NoRedo,
    CommandStarted(String),
    CommandFinished(String, CommandKind),
    PreconditionFailed(String),
    ExecutionFailed(String),
    PostconditionFailed(String),
    HistoryNonEmpty,
    HistoryEmpty,
}

impl ModifyNotification {
    fn dispatch(&self, observer: &dyn ModifyObserver) {
        match self {
            ModifyNotification::CanUndo(name) => observer.note_can_undo(name),
            ModifyNotification::CanRedo(name) => observer.note_can_redo(name),
            ModifyNotification::NoUndo => observer.note_no_undo(),
            ModifyNotification::NoRedo => observer.note_no_redo(),
            ModifyNotification::CommandStarted(name) => observer.note_command_did_start(name),
            ModifyNotification::CommandFinished(name, kind) => {
                observer.note_command_did_finish(name, *kind)
            }
            ModifyNotification::PreconditionFailed(name) => {
                observer.note_command_precondition_failed(name)
            }
            ModifyNotification::ExecutionFailed(name) => observer.note_command_execution_failed(name),
            ModifyNotification::PostconditionFailed(name) => {
                observer.note_command_postcondition_failed(name)
            }
            ModifyNotification::HistoryNonEmpty => observer.note_history_non_empty(),
            ModifyNotification::HistoryEmpty => observer.note_history_empty(),
        }
    }

    fn for_error(command_name: &str, error: &CommandError) -> Option<Self> {
        match error {
            CommandError::Precondition { .. } => Some(Self::PreconditionFailed(command_name.to_string())),
            CommandError::Execution { .. } => Some(Self::ExecutionFailed(command_name.to_string())),
            CommandError::Postcondition { .. } => Some(Self::PostconditionFailed(command_name.to_string())),
            _ => None,
        }
    }
}

/// One line of the command history
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HistoryEntry {
    pub kind: CommandKind,
    pub message: String,
    pub at: DateTime<Utc>,
}

impl HistoryEntry {
    /// "Do Rename entity 3 to 'x'"
    pub fn line(&self) -> String {
        format!("{} {}", self.kind, self.message)
    }
}

#[derive(Default)]
struct Stacks {
    /// most recent first
    undo: VecDeque<Box<dyn Command>>,
    /// most recent first
    redo: VecDeque<Box<dyn Command>>,
    executed_names: Vec<String>,
    history: Vec<HistoryEntry>,
}

type Observers = Arc<RwLock<Vec<Arc<dyn ModifyObserver>>>>;

pub struct ModifyMgr {
    notifier: Arc<Notifier>,
    observers: Observers,
    stacks: Mutex<Stacks>,
    /// serializes do/undo/redo
    running: tokio::sync::Mutex<()>,
    dump_stacks: bool,
}

impl ModifyMgr {
    pub fn new(notifier: Arc<Notifier>, dump_stacks: bool) -> Self {
        Self {
            notifier,
            observers: Arc::new(RwLock::new(Vec::new())),
            stacks: Mutex::new(Stacks::default()),
            running: tokio::sync::Mutex::new(()),
            dump_stacks,
        }
    }

    pub fn add_observer(&self, observer: Arc<dyn ModifyObserver>) {
        let mut observers = self.observers.write();
        if !observers.iter().any(|o| Arc::ptr_eq(o, &observer)) {
            observers.push(observer);
        }
    }

    pub fn remove_observer(&self, observer: &Arc<dyn ModifyObserver>) {
        self.observers.write().retain(|o| !Arc::ptr_eq(o, observer));
    }

    fn post(&self, notification: ModifyNotification) {
        let observers = Arc::clone(&self.observers);
        self.notifier.notify(Box::new(move || {
            let observers: Vec<Arc<dyn ModifyObserver>> = observers.read().clone();
            for observer in observers {
                notification.dispatch(observer.as_ref());
            }
        }));
    }

    /// Post the matching failure notification and route the error to the central handler
    fn fail(&self, command_name: &str, error: CommandError) -> CommandError {
        if let Some(notification) = ModifyNotification::for_error(command_name, &error) {
            self.post(notification);
        }
        handle_error(&error);
        error
    }

    fn record(&self, kind: CommandKind, message: String) {
        let was_empty = {
            let mut stacks = self.stacks.lock();
            let was_empty = stacks.history.is_empty();
            stacks.history.push(HistoryEntry {
                kind,
                message,
                at: Utc::now(),
            });
            was_empty
        };
        if was_empty {
            self.post(ModifyNotification::HistoryNonEmpty);
        }
    }

    /// Validate, execute and record a new command
    pub async fn do_command(&self, command: Box<dyn Command>) -> Result<(), CommandError> {
        let _running = self.running.lock().await;
        let name = command.name();
        debug!("Do {}", command.log_message());

        if let Err(e) = command.validate_preconditions().await {
            return Err(self.fail(&name, e));
        }

        self.post(ModifyNotification::CommandStarted(name.clone()));
        let inverse = match command.execute().await {
            Ok(inverse) => inverse,
            Err(e) => return Err(self.fail(&name, e)),
        };

        self.flush_redo();

        if let Err(e) = command.validate_postconditions().await {
            return Err(self.fail(&name, e));
        }

        if let Some(inverse) = &inverse {
            if inverse.id() == command.id() {
                let error = CommandError::BadCommandInverse {
                    command: name.clone(),
                    id: command.id(),
                };
                return Err(self.fail(&name, error));
            }
        }

        self.post(ModifyNotification::CommandFinished(name.clone(), CommandKind::Do));
        self.stacks.lock().executed_names.push(name);
        self.record(CommandKind::Do, command.log_message());
        match inverse {
            Some(inverse) => self.stacks.lock().undo.push_front(inverse),
            None => self.flush_undo(),
        }

        self.notify_status();
        Ok(())
    }

    /// Run the inverse of the most recent command.
    ///
    /// The command is popped before it runs. If it fails, it is dropped and
    /// lands on neither list; the status posted afterwards reflects that.
    pub async fn undo_command(&self) -> Result<(), CommandError> {
        let _running = self.running.lock().await;
        let popped = self.stacks.lock().undo.pop_front();
        let Some(undo) = popped else {
            return Err(self.fail("undo", CommandError::AbsentUndo));
        };
        let name = undo.name();
        debug!("Undo {}", undo.log_message());
        self.record(CommandKind::Undo, undo.log_message());

        self.post(ModifyNotification::CommandStarted(name.clone()));
        let redo = match undo.execute().await {
            Ok(redo) => redo,
            Err(e) => {
                self.notify_status();
                return Err(self.fail(&name, e));
            }
        };
        self.post(ModifyNotification::CommandFinished(name.clone(), CommandKind::Undo));
        self.stacks.lock().executed_names.pop();

        if let Some(redo) = &redo {
            if redo.id() == undo.id() {
                let error = CommandError::BadCommandInverse {
                    command: name.clone(),
                    id: undo.id(),
                };
                self.notify_status();
                return Err(self.fail(&name, error));
            }
        }
        match redo {
            Some(redo) => self.stacks.lock().redo.push_front(redo),
            None => self.flush_redo(),
        }

        self.notify_status();
        Ok(())
    }

    /// Run the inverse of the most recent undo. A failing redo is dropped the
    /// same way as a failing undo.
    pub async fn redo_command(&self) -> Result<(), CommandError> {
        let _running = self.running.lock().await;
        let popped = self.stacks.lock().redo.pop_front();
        let Some(redo) = popped else {
            return Err(self.fail("redo", CommandError::AbsentRedo));
        };
        let name = redo.name();
        debug!("Redo {}", redo.log_message());
        self.record(CommandKind::Redo, redo.log_message());

        self.post(ModifyNotification::CommandStarted(name.clone()));
        let undo = match redo.execute().await {
            Ok(undo) => undo,
            Err(e) => {
                self.notify_status();
                return Err(self.fail(&name, e));
            }
        };
        self.post(ModifyNotification::CommandFinished(name.clone(), CommandKind::Redo));
        self.stacks.lock().executed_names.push(name.clone());

        if let Some(undo) = &undo {
            if undo.id() == redo.id() {
                let error = CommandError::BadCommandInverse {
                    command: name.clone(),
                    id: redo.id(),
                };
                self.notify_status();
                return Err(self.fail(&name, error));
            }
        }
        match undo {
            Some(undo) => self.stacks.lock().undo.push_front(undo),
            None => self.flush_undo(),
        }

        self.notify_status();
        Ok(())
    }

    pub fn can_undo(&self) -> bool {
        !self.stacks.lock().undo.is_empty()
    }

    pub fn can_redo(&self) -> bool {
        !self.stacks.lock().redo.is_empty()
    }

    pub fn latest_undo_name(&self) -> Option<String> {
        self.stacks.lock().undo.front().map(|c| c.name())
    }

    pub fn latest_redo_name(&self) -> Option<String> {
        self.stacks.lock().redo.front().map(|c| c.name())
    }

    /// Names of the commands currently in effect, oldest first
    pub fn executed_command_names(&self) -> Vec<String> {
        self.stacks.lock().executed_names.clone()
    }

    pub fn command_history(&self) -> Vec<HistoryEntry> {
        self.stacks.lock().history.clone()
    }

    pub fn clear_history(&self) {
        let had_history = {
            let mut stacks = self.stacks.lock();
            let had_history = !stacks.history.is_empty();
            stacks.history.clear();
            had_history
        };
        if had_history {
            self.post(ModifyNotification::HistoryEmpty);
        }
    }

    fn flush_undo(&self) {
        let flushed = {
            let mut stacks = self.stacks.lock();
            let flushed = !stacks.undo.is_empty();
            stacks.undo.clear();
            flushed
        };
        if flushed {
            debug!("Undo list flushed");
            self.post(ModifyNotification::NoUndo);
        }
    }

    fn flush_redo(&self) {
        let flushed = {
            let mut stacks = self.stacks.lock();
            let flushed = !stacks.redo.is_empty();
            stacks.redo.clear();
            flushed
        };
        if flushed {
            debug!("Redo list flushed");
            self.post(ModifyNotification::NoRedo);
        }
    }

    /// Forget every undo and redo entry
    pub fn flush_stacks(&self) {
        self.flush_undo();
        self.flush_redo();
        self.stacks.lock().executed_names.clear();
    }

    fn notify_status(&self) {
        let (undo, redo) = {
            let stacks = self.stacks.lock();
            (
                stacks.undo.front().map(|c| c.name()),
                stacks.redo.front().map(|c| c.name()),
            )
        };
        self.post(match undo {
            Some(name) => ModifyNotification::CanUndo(name),
            None => ModifyNotification::NoUndo,
        });
        self.post(match redo {
            Some(name) => ModifyNotification::CanRedo(name),
            None => ModifyNotification::NoRedo,
        });
        if self.dump_stacks {
            self.dump_stacks();
        }
    }

    /// Log the content of both lists at debug level
    pub fn dump_stacks(&self) {
        let stacks = self.stacks.lock();
        debug!("Undo list ({}):", stacks.undo.len());
        for command in &stacks.undo {
            debug!("  {}", command.log_message());
        }
        debug!("Redo list ({}):", stacks.redo.len());
        for command in &stacks.redo {
            debug!("  {}", command.log_message());
        }
    }
}
