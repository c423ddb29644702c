use async_trait::async_trait;
use itertools::Itertools;
use log::debug;
use std::fmt;
use uuid::Uuid;

use crate::error::CommandError;
use crate::model::generate_command_id;

pub type CommandId = Uuid;

/// How a command reached the command stack
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandKind {
    Do,
    Undo,
    Redo,
}

impl fmt::Display for CommandKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CommandKind::Do => write!(f, "Do"),
            CommandKind::Undo => write!(f, "Undo"),
            CommandKind::Redo => write!(f, "Redo"),
        }
    }
}

/// A reified, optionally reversible modification of the model.
///
/// `execute` returns the command that reverses it, or `None` when the
/// modification cannot be undone. The inverse must be a new command with its
/// own id.
#[async_trait]
pub trait Command: Send + Sync {
    fn id(&self) -> CommandId;

    /// Short name shown in undo/redo menus
    fn name(&self) -> String;

    /// Line recorded in the command history
    fn log_message(&self) -> String {
        self.name()
    }

    async fn validate_preconditions(&self) -> Result<(), CommandError> {
        Ok(())
    }

    async fn execute(&self) -> Result<Option<Box<dyn Command>>, CommandError>;

    async fn validate_postconditions(&self) -> Result<(), CommandError> {
        Ok(())
    }
}

impl fmt::Debug for dyn Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.name(), self.id())
    }
}

/// Runs its commands in order. The inverse runs their inverses in reverse
/// order, and only exists when every command was invertible.
pub struct CompositeCommand {
    id: CommandId,
    name: String,
    commands: Vec<Box<dyn Command>>,
}

impl CompositeCommand {
    pub fn new(name: impl Into<String>, commands: Vec<Box<dyn Command>>) -> Self {
        Self {
            id: generate_command_id(),
            name: name.into(),
            commands,
        }
    }

    pub fn len(&self) -> usize {
        self.commands.len()
    }

    pub fn is_empty(&self) -> bool {
        self.commands.is_empty()
    }
}

#[async_trait]
impl Command for CompositeCommand {
    fn id(&self) -> CommandId {
        self.id
    }

    fn name(&self) -> String {
        self.name.clone()
    }

    fn log_message(&self) -> String {
        format!(
            "{} [{}]",
            self.name,
            self.commands.iter().map(|c| c.log_message()).join(", ")
        )
    }

    async fn validate_preconditions(&self) -> Result<(), CommandError> {
        for command in &self.commands {
            command.validate_preconditions().await?;
        }
        Ok(())
    }

    async fn execute(&self) -> Result<Option<Box<dyn Command>>, CommandError> {
        let mut inverses = Vec::with_capacity(self.commands.len());
        let mut invertible = true;
        for command in &self.commands {
            debug!("Executing {} as part of {}", command.name(), self.name);
            match command.execute().await? {
                Some(inverse) => inverses.push(inverse),
                None => invertible = false,
            }
        }
        if !invertible {
            return Ok(None);
        }
        inverses.reverse();
        Ok(Some(Box::new(CompositeCommand::new(self.name.clone(), inverses))))
    }

    async fn validate_postconditions(&self) -> Result<(), CommandError> {
        for command in &self.commands {
            command.validate_postconditions().await?;
        }
        Ok(())
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use parking_lot::Mutex;
    use std::sync::Arc;

    /// Records its execution in a shared journal; its inverse records "<label>-1"
    pub(crate) struct Journaled {
        id: CommandId,
        label: String,
        journal: Arc<Mutex<Vec<String>>>,
        invertible: bool,
    }

    impl Journaled {
        pub(crate) fn new(label: &str, journal: &Arc<Mutex<Vec<String>>>) -> Self {
            Self {
                id: generate_command_id(),
                label: label.to_string(),
                journal: Arc::clone(journal),
                invertible: true,
            }
        }

        pub(crate) fn final_step(mut self) -> Self {
            self.invertible = false;
            self
        }
    }

    #[async_trait]
    impl Command for Journaled {
        fn id(&self) -> CommandId {
            self.id
        }

        fn name(&self) -> String {
            self.label.clone()
        }

        async fn execute(&self) -> Result<Option<Box<dyn Command>>, CommandError> {
            self.journal.lock().push(self.label.clone());
            if !self.invertible {
                return Ok(None);
            }
            let inverse_label = match self.label.strip_suffix("-1") {
                Some(original) => original.to_string(),
                None => format!("{}-1", self.label),
            };
            Ok(Some(Box::new(Journaled::new(&inverse_label, &self.journal))))
        }
    }

    #[tokio::test]
    async fn test_composite_inverse_runs_in_reverse() {
        let journal = Arc::new(Mutex::new(Vec::new()));
        let composite = CompositeCommand::new(
            "Edit",
            vec![
                Box::new(Journaled::new("A", &journal)),
                Box::new(Journaled::new("B", &journal)),
                Box::new(Journaled::new("C", &journal)),
            ],
        );

        let inverse = composite.execute().await.unwrap().expect("invertible");
        assert_ne!(inverse.id(), composite.id());
        inverse.execute().await.unwrap();

        assert_eq!(*journal.lock(), vec!["A", "B", "C", "C-1", "B-1", "A-1"]);
    }

    #[tokio::test]
    async fn test_composite_with_final_step_is_not_invertible() {
        let journal = Arc::new(Mutex::new(Vec::new()));
        let composite = CompositeCommand::new(
            "Delete",
            vec![
                Box::new(Journaled::new("A", &journal)),
                Box::new(Journaled::new("B", &journal).final_step()),
            ],
        );

        assert!(composite.execute().await.unwrap().is_none());
        assert_eq!(*journal.lock(), vec!["A", "B"]);
    }

    #[test]
    fn test_log_message_lists_children() {
        let journal = Arc::new(Mutex::new(Vec::new()));
        let composite = CompositeCommand::new(
            "Edit",
            vec![Box::new(Journaled::new("A", &journal)), Box::new(Journaled::new("B", &journal))],
        );
        assert_eq!(composite.log_message(), "Edit [A, B]");
        assert_eq!(composite.len(), 2);
    }
}
