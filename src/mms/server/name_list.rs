//! GetNameList service.

use tracing::instrument;

use super::connection::{MmsServerConnection, ServiceResult};
use crate::mms::message::{
    ConfirmedResponse, ObjectClass, ObjectScope, ServiceError,
    server::{NAME_LIST_OVERHEAD, name_list_entry_size},
};

impl MmsServerConnection {
    /// List the objects of a class in a scope, one page at a time.
    #[instrument(skip(self))]
    pub(super) async fn get_name_list(
        &self,
        object_class: ObjectClass,
        scope: &ObjectScope,
        continue_after: Option<&str>,
    ) -> ServiceResult {
        let device = &self.server.device;
        let names = match (object_class, scope) {
            (ObjectClass::Domain, ObjectScope::Vmd) => device.domain_names(),
            (ObjectClass::NamedVariable, ObjectScope::Vmd) => device.named_variable_names(),
            (ObjectClass::NamedVariable, ObjectScope::Domain(domain)) => device
                .get_domain(domain)
                .ok_or(ServiceError::ACCESS_OBJECT_NON_EXISTENT)?
                .named_variable_names(),
            (ObjectClass::NamedVariableList, ObjectScope::Domain(domain)) => self
                .server
                .model
                .read()
                .await
                .domain_lists
                .get(domain)
                .ok_or(ServiceError::ACCESS_OBJECT_NON_EXISTENT)?
                .names(),
            (ObjectClass::NamedVariableList, ObjectScope::Association) => {
                self.association_lists.names()
            }
            (ObjectClass::Journal, ObjectScope::Domain(domain)) => {
                device.get_domain(domain).ok_or(ServiceError::ACCESS_OBJECT_NON_EXISTENT)?;
                Vec::new()
            }
            _ => return Err(ServiceError::ACCESS_OBJECT_ACCESS_UNSUPPORTED.into()),
        };
        let (names, more_follows) = paginate(names, continue_after, self.max_pdu_size())?;
        Ok(Some(ConfirmedResponse::GetNameList { names, more_follows }))
    }
}

/// The names after `continue_after` that fit in one response of `max_pdu_size` bytes,
/// and whether names were left out.
fn paginate(
    names: Vec<String>,
    continue_after: Option<&str>,
    max_pdu_size: usize,
) -> Result<(Vec<String>, bool), ServiceError> {
    let start = match continue_after {
        Some(after) => {
            names
                .iter()
                .position(|name| name == after)
                .ok_or(ServiceError::ACCESS_OBJECT_ACCESS_UNSUPPORTED)?
                + 1
        }
        None => 0,
    };

    let mut size = NAME_LIST_OVERHEAD;
    let mut page = Vec::new();
    for name in names.into_iter().skip(start) {
        let entry_size = name_list_entry_size(&name);
        if size + entry_size > max_pdu_size {
            return Ok((page, true));
        }
        size += entry_size;
        page.push(name);
    }
    Ok((page, false))
}
