//! Named variable list services: define, get attributes and delete.

use tracing::{info, instrument};

use super::connection::{MmsServerConnection, ServiceResult};
use crate::mms::{
    device::{ListDeletion, NamedVariableList, NamedVariableListEntry},
    message::{ConfirmedResponse, DeleteScope, ObjectName, ServiceError, VariableAccessItem},
    type_spec::TypeKind,
};

impl MmsServerConnection {
    /// A copy of the list called `name`, looked up in the scope the name carries.
    pub(super) async fn find_list(&self, name: &ObjectName) -> Option<NamedVariableList> {
        match name {
            ObjectName::DomainSpecific { domain_id, item_id } => {
                self.server.model.read().await.domain_lists.get(domain_id)?.get(item_id).cloned()
            }
            ObjectName::VmdSpecific(item) => {
                self.server.model.read().await.vmd_lists.get(item).cloned()
            }
            ObjectName::AaSpecific(item) => self.association_lists.get(item).cloned(),
        }
    }

    /// True if the variable an entry refers to exists, including its array element.
    fn entry_exists(&self, entry: &NamedVariableListEntry) -> bool {
        let Some(spec) = self.server.device.lookup_variable(&entry.domain_id, &entry.item_id) else {
            return false;
        };
        match (entry.array_index, &spec.kind) {
            (None, _) => true,
            (Some(index), TypeKind::Array { element_count, element }) => {
                index < *element_count
                    && entry.component_name.as_ref().is_none_or(|component| {
                        element.get_named_sub(component).is_some()
                    })
            }
            (Some(_), _) => false,
        }
    }

    /// Create a deletable list in a domain or in the association.
    #[instrument(skip(self, items), fields(count = items.len()))]
    pub(super) async fn define_named_variable_list(
        &mut self,
        name: &ObjectName,
        items: &[VariableAccessItem],
    ) -> ServiceResult {
        let config = &self.server.config;
        if items.len() > config.max_data_set_entries {
            return Err(ServiceError::RESOURCE_CAPABILITY_UNAVAILABLE.into());
        }
        let entries = items
            .iter()
            .map(NamedVariableListEntry::try_from)
            .collect::<Result<Vec<_>, _>>()
            .map_err(|_| ServiceError::ACCESS_OBJECT_ACCESS_UNSUPPORTED)?;
        if !entries.iter().all(|entry| self.entry_exists(entry)) {
            return Err(ServiceError::ACCESS_OBJECT_NON_EXISTENT.into());
        }

        match name {
            ObjectName::DomainSpecific { domain_id, item_id } => {
                let mut model = self.server.model.write().await;
                let lists = model
                    .domain_lists
                    .get_mut(domain_id)
                    .ok_or(ServiceError::ACCESS_OBJECT_NON_EXISTENT)?;
                if !lists.add(NamedVariableList::new(item_id.clone(), true, entries)) {
                    return Err(ServiceError::DEFINITION_OBJECT_EXISTS.into());
                }
            }
            ObjectName::AaSpecific(item) => {
                if self.association_lists.contains(item) {
                    return Err(ServiceError::DEFINITION_OBJECT_EXISTS.into());
                }
                if self.association_lists.len() >= config.max_association_data_sets {
                    return Err(ServiceError::RESOURCE_CAPABILITY_UNAVAILABLE.into());
                }
                self.association_lists.add(NamedVariableList::new(item.clone(), true, entries));
            }
            ObjectName::VmdSpecific(_) => {
                return Err(ServiceError::ACCESS_OBJECT_ACCESS_UNSUPPORTED.into());
            }
        }
        info!("Defined named variable list {name:?}");
        Ok(Some(ConfirmedResponse::DefineNamedVariableList))
    }

    /// The deletable flag and the entries of a list.
    #[instrument(skip(self))]
    pub(super) async fn get_named_variable_list_attributes(
        &self,
        name: &ObjectName,
    ) -> ServiceResult {
        let list = self.find_list(name).await.ok_or(ServiceError::ACCESS_OBJECT_NON_EXISTENT)?;
        Ok(Some(ConfirmedResponse::GetNamedVariableListAttributes {
            deletable: list.deletable,
            items: list.entries.iter().map(VariableAccessItem::from).collect(),
        }))
    }

    /// Delete the named lists that exist and are deletable.
    #[instrument(skip(self))]
    pub(super) async fn delete_named_variable_list(
        &mut self,
        scope: DeleteScope,
        names: &[ObjectName],
    ) -> ServiceResult {
        if scope != DeleteScope::Specific {
            return Err(ServiceError::ACCESS_OBJECT_ACCESS_UNSUPPORTED.into());
        }

        let mut matched = 0;
        let mut deleted = 0;
        for name in names {
            let deletion = match name {
                ObjectName::DomainSpecific { domain_id, item_id } => {
                    let mut model = self.server.model.write().await;
                    model
                        .domain_lists
                        .get_mut(domain_id)
                        .map_or(ListDeletion::NotFound, |lists| lists.delete(item_id))
                }
                ObjectName::AaSpecific(item) => self.association_lists.delete(item),
                ObjectName::VmdSpecific(item) => {
                    self.server.model.write().await.vmd_lists.delete(item)
                }
            };
            match deletion {
                ListDeletion::NotFound => {}
                ListDeletion::NotDeletable => matched += 1,
                ListDeletion::Deleted => {
                    matched += 1;
                    deleted += 1;
                }
            }
        }
        info!("Deleted {deleted} of {matched} matched lists");
        Ok(Some(ConfirmedResponse::DeleteNamedVariableList { matched, deleted }))
    }
}
