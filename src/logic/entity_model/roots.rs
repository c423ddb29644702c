use log::debug;

use super::EntityModel;
use crate::error::{ModelError, ModelResult};
use crate::model::{attributes, ChildRef, EntityHandle, EntityId, OntologyTermType};

impl EntityModel {
    /// Workspaces of the subject with their children loaded. The list is
    /// cached until one of the workspaces leaves the cache.
    pub async fn get_workspaces(&self) -> ModelResult<Vec<EntityHandle>> {
        let guard = self.lock().await;
        let cached = self.cached_workspaces();
        if !cached.is_empty() {
            return Ok(cached);
        }

        debug!("Loading workspaces");
        let mut workspaces = Vec::new();
        for workspace in self.facade.get_workspaces().await? {
            if let Some(canonical) = self.put_or_update(&guard, workspace) {
                let loaded = self.load_lazy_entity_locked(&guard, &canonical, false).await?;
                workspaces.push(loaded);
            }
        }
        self.state.lock().index.workspaces = workspaces.clone();
        Ok(workspaces)
    }

    /// Create a folder in the workspace and mark it as a common root
    pub async fn create_common_root_folder(&self, workspace_id: EntityId, name: &str) -> ModelResult<EntityHandle> {
        let guard = self.lock().await;
        let created = self
            .facade
            .create_folder_in_workspace(workspace_id, name)
            .await?;
        let folder = self.admit(&guard, created)?;
        debug!("Created common root {} in workspace {}", folder.identify(), workspace_id);
        self.invalidate_ids_locked(&guard, &[workspace_id]).await?;
        Ok(folder)
    }

    /// Common roots of the workspace with the given name
    pub async fn get_common_roots_by_name(&self, workspace_id: EntityId, name: &str) -> ModelResult<Vec<EntityHandle>> {
        let workspace = self
            .get_entity_and_children(workspace_id)
            .await?
            .ok_or(ModelError::NotFound(workspace_id))?;
        let children = workspace.read().ordered_children();
        Ok(children
            .into_iter()
            .filter(|root| root.read().name == name)
            .collect())
    }

    /// The first common root owned by the subject with the given name, across all workspaces
    pub async fn get_owned_common_root_by_name(&self, name: &str) -> ModelResult<Option<EntityHandle>> {
        let subject = self.subject_key().to_string();
        for workspace in self.get_workspaces().await? {
            let children = workspace.read().ordered_children();
            let found = children.into_iter().find(|root| {
                let root = root.read();
                root.name == name && root.is_owned_by(&subject)
            });
            if found.is_some() {
                return Ok(found);
            }
        }
        Ok(None)
    }

    /// Remove the common root marker so the folder becomes an ordinary folder
    pub async fn demote_common_root_to_folder(&self, common_root: &EntityHandle) -> ModelResult<EntityHandle> {
        let common_root = self.canonicalize(common_root);
        let _guard = self.lock().await;
        let marker = common_root
            .read()
            .entity_data_by_attribute_name(attributes::COMMON_ROOT)
            .cloned();
        let marker = marker.ok_or_else(|| {
            ModelError::InvalidArgument(format!("{} is not a common root", common_root.identify()))
        })?;
        let edge_id = marker
            .id
            .ok_or_else(|| ModelError::InvalidArgument("common root marker has not been saved".to_string()))?;

        self.facade.remove_entity_data(edge_id).await?;
        common_root
            .write()
            .entity_data
            .retain(|ed| ed.id != Some(edge_id));
        debug!("Demoted {} to a folder", common_root.identify());
        self.notify_entity_changed(&common_root);
        Ok(common_root)
    }

    /// Ontology roots readable by the subject, with their whole tree cached
    pub async fn get_ontology_roots(&self) -> ModelResult<Vec<EntityHandle>> {
        let guard = self.lock().await;
        let cached = self.cached_ontology_roots();
        if !cached.is_empty() {
            return Ok(cached);
        }

        debug!("Loading ontology roots");
        let fetched = self.facade.get_ontology_roots().await?;
        let roots: Vec<EntityHandle> = fetched
            .into_iter()
            .filter_map(|root| self.put_or_update_tree(&guard, root))
            .collect();
        self.state.lock().index.ontology_roots = roots.clone();
        Ok(roots)
    }

    /// The subject's own ontology root with the given name
    pub async fn get_ontology_root(&self, name: &str) -> ModelResult<Option<EntityHandle>> {
        let subject = self.subject_key().to_string();
        let roots = self.get_ontology_roots().await?;
        Ok(roots.into_iter().find(|root| {
            let root = root.read();
            root.name == name && root.is_owned_by(&subject)
        }))
    }

    pub async fn create_ontology_root(&self, name: &str) -> ModelResult<EntityHandle> {
        let root = {
            let guard = self.lock().await;
            let created = self.facade.create_ontology_root(name).await?;
            let root = self.admit(&guard, created)?;
            let mut state = self.state.lock();
            if !state.index.ontology_roots.is_empty() {
                state.index.ontology_roots.push(root.clone());
            }
            root
        };
        debug!("Created ontology root {}", root.identify());
        self.notify_entity_created(&root);
        Ok(root)
    }

    /// Create a term under the given ontology element and link it into the cached parent
    pub async fn create_ontology_term(
        &self,
        parent_id: EntityId,
        label: &str,
        term_type: OntologyTermType,
        order_index: Option<i32>,
    ) -> ModelResult<EntityHandle> {
        let parent = self
            .get_entity_by_id(parent_id)
            .await?
            .ok_or(ModelError::NotFound(parent_id))?;
        let guard = self.lock().await;

        let mut edge = self
            .facade
            .create_ontology_term(parent_id, label, term_type, order_index)
            .await?;
        let term = match &edge.child {
            Some(ChildRef::Loaded(term)) => term.snapshot(),
            _ => {
                return Err(ModelError::Remote(anyhow::anyhow!(
                    "server did not return the created term '{}'",
                    label
                )))
            }
        };
        let term = self.admit(&guard, term)?;
        edge.parent_id = Some(parent_id);
        edge.child = Some(ChildRef::Loaded(term.clone()));

        let parent = self.canonicalize(&parent);
        {
            let mut cached = parent.write();
            cached.entity_data.push(edge);
            cached.num_children = Some(cached.child_count() as i32);
        }
        self.state.lock().index.add_parent(term.id(), parent_id);
        debug!("Created ontology term {} under {}", term.identify(), parent.identify());
        self.notify_entity_changed(&parent);
        Ok(term)
    }
}
