//! Read, Write and GetVariableAccessAttributes services.

use std::borrow::Cow;

use tracing::{debug, instrument};

use super::{
    ModelState, WriteIndication,
    connection::{MmsServerConnection, ServiceFailure, ServiceResult},
};
use crate::mms::{
    device::split_item_name,
    message::{
        AlternateAccess, ConfirmedResponse, ObjectName, RejectReason, ServiceError,
        VariableAccessItem, VariableAccessSpecification,
    },
    type_spec::{MmsTypeSpec, TypeKind},
    value::{DataAccessError, MmsValue},
};

/// Domain (empty for the VMD) and item of a variable name.
fn variable_address(name: &ObjectName) -> Option<(&str, &str)> {
    match name {
        ObjectName::VmdSpecific(item) => Some(("", item)),
        ObjectName::DomainSpecific { domain_id, item_id } => Some((domain_id, item_id)),
        ObjectName::AaSpecific(_) => None,
    }
}

/// Join a component path and a sub path with `$`.
fn join_path(path: &str, sub_path: &str) -> String {
    if path.is_empty() {
        sub_path.to_owned()
    } else {
        format!("{path}${sub_path}")
    }
}

/// The sub paths of an array variable of type `spec` selected by `access`, and whether
/// they form a range (an array value) rather than a single element.
fn selected_paths(
    spec: &MmsTypeSpec,
    access: &AlternateAccess,
) -> Result<(Vec<String>, bool), DataAccessError> {
    let TypeKind::Array { element_count, .. } = &spec.kind else {
        return Err(DataAccessError::ObjectNonExistent);
    };
    let in_range = |index: u32| {
        if index < *element_count {
            Ok(())
        } else {
            Err(DataAccessError::ObjectNonExistent)
        }
    };
    match access {
        AlternateAccess::Index(index) | AlternateAccess::IndexRange { low: index, count: 0 } => {
            in_range(*index)?;
            Ok((vec![index.to_string()], false))
        }
        AlternateAccess::IndexComponent { index, component } => {
            in_range(*index)?;
            Ok((vec![format!("{index}${component}")], false))
        }
        AlternateAccess::IndexRange { low, count } => {
            let last = low.checked_add(*count - 1).ok_or(DataAccessError::ObjectNonExistent)?;
            in_range(last)?;
            Ok(((*low..=last).map(|index| index.to_string()).collect(), true))
        }
    }
}

/// The part of `value`, a value of type `spec`, selected by `access`.
fn select(
    spec: &MmsTypeSpec,
    value: &MmsValue,
    access: Option<&AlternateAccess>,
) -> Result<MmsValue, DataAccessError> {
    let Some(access) = access else {
        return Ok(value.clone());
    };
    let (paths, range) = selected_paths(spec, access)?;
    let mut elements = paths
        .iter()
        .map(|path| {
            spec.get_child_value(value, path).cloned().ok_or(DataAccessError::ObjectNonExistent)
        })
        .collect::<Result<Vec<_>, _>>()?;
    if range {
        Ok(MmsValue::Array(elements))
    } else {
        elements.pop().ok_or(DataAccessError::ObjectNonExistent)
    }
}

impl MmsServerConnection {
    /// The items a specification refers to. A list name is resolved to its entries.
    pub(super) async fn resolve_items<'a>(
        &self,
        specification: &'a VariableAccessSpecification,
    ) -> Result<Cow<'a, [VariableAccessItem]>, ServiceError> {
        match specification {
            VariableAccessSpecification::ListOfVariable(items) => Ok(Cow::Borrowed(items)),
            VariableAccessSpecification::VariableListName(name) => {
                let list =
                    self.find_list(name).await.ok_or(ServiceError::ACCESS_OBJECT_NON_EXISTENT)?;
                Ok(Cow::Owned(list.entries.iter().map(VariableAccessItem::from).collect()))
            }
        }
    }

    /// Read every item, each failing on its own with an access error.
    #[instrument(skip(self, specification))]
    pub(super) async fn read(
        &self,
        specification_with_result: bool,
        specification: VariableAccessSpecification,
    ) -> ServiceResult {
        let items = self.resolve_items(&specification).await?;
        let results = {
            let model = self.server.model.read().await;
            items
                .iter()
                .map(|item| {
                    self.read_item(&model, item).unwrap_or_else(|error| {
                        debug!("Read of {:?} failed: {error}", item.name);
                        MmsValue::new_data_access_error(error)
                    })
                })
                .collect()
        };
        drop(items);
        Ok(Some(ConfirmedResponse::Read {
            specification: specification_with_result.then_some(specification),
            results,
        }))
    }

    /// The value of one item, from the read handler or else from the cache.
    fn read_item(
        &self,
        model: &ModelState,
        item: &VariableAccessItem,
    ) -> Result<MmsValue, DataAccessError> {
        let (domain, item_id) =
            variable_address(&item.name).ok_or(DataAccessError::ObjectNonExistent)?;
        let top = self
            .server
            .device
            .top_level_variable(domain, item_id)
            .ok_or(DataAccessError::ObjectNonExistent)?;
        let (_, path) = split_item_name(item_id);
        let spec = top.get_named_sub(path).ok_or(DataAccessError::ObjectNonExistent)?;
        let access = item.alternate_access.as_ref();

        if let Some(value) = self
            .server
            .read_handler
            .as_ref()
            .and_then(|handler| handler.read(domain, item_id, self.id()))
        {
            return select(spec, &value, access);
        }
        let value = model.value(domain, top, path).ok_or(DataAccessError::ObjectNonExistent)?;
        select(spec, value, access)
    }

    /// Write every item in order and collect the results.
    #[instrument(skip(self, specification, data), fields(count = data.len()))]
    pub(super) async fn write(
        &self,
        specification: &VariableAccessSpecification,
        data: &[MmsValue],
    ) -> ServiceResult {
        let items = self.resolve_items(specification).await?;
        if items.len() != data.len() {
            return Err(ServiceFailure::Reject(RejectReason::INVALID_ARGUMENT));
        }

        let mut respond = true;
        let mut results = Vec::with_capacity(items.len());
        for (item, value) in items.iter().zip(data) {
            let result = match self.write_item(item, value).await {
                Ok(WriteIndication::NoResponse) => {
                    respond = false;
                    Ok(())
                }
                Ok(_) => Ok(()),
                Err(error) => {
                    debug!("Write of {:?} failed: {error}", item.name);
                    Err(error)
                }
            };
            results.push(result);
        }
        Ok(respond.then_some(ConfirmedResponse::Write(results)))
    }

    /// Type check one item, ask the write handler and apply the value.
    async fn write_item(
        &self,
        item: &VariableAccessItem,
        value: &MmsValue,
    ) -> Result<WriteIndication, DataAccessError> {
        let (domain, item_id) =
            variable_address(&item.name).ok_or(DataAccessError::ObjectNonExistent)?;
        let top = self
            .server
            .device
            .top_level_variable(domain, item_id)
            .ok_or(DataAccessError::ObjectNonExistent)?;
        let (_, path) = split_item_name(item_id);
        let spec = top.get_named_sub(path).ok_or(DataAccessError::ObjectNonExistent)?;

        let targets: Vec<(String, &MmsValue)> = match &item.alternate_access {
            None => vec![(path.to_owned(), value)],
            Some(access) => {
                let (paths, range) = selected_paths(spec, access)?;
                if range {
                    let MmsValue::Array(elements) = value else {
                        return Err(DataAccessError::TypeInconsistent);
                    };
                    if elements.len() != paths.len() {
                        return Err(DataAccessError::TypeInconsistent);
                    }
                    paths.iter().map(|p| join_path(path, p)).zip(elements).collect()
                } else {
                    paths.iter().map(|p| (join_path(path, p), value)).collect()
                }
            }
        };
        for (target, element) in &targets {
            let target_spec = top.get_named_sub(target).ok_or(DataAccessError::ObjectNonExistent)?;
            if !target_spec.is_value_of_type(element) {
                return Err(DataAccessError::TypeInconsistent);
            }
        }

        let indication = self
            .server
            .write_handler
            .as_ref()
            .map_or(WriteIndication::Ok, |handler| {
                handler.write(domain, item_id, value, self.id())
            });
        match indication {
            WriteIndication::Ok => {
                let mut model = self.server.model.write().await;
                for (target, element) in &targets {
                    model.apply(domain, top, target, element)?;
                }
                Ok(indication)
            }
            WriteIndication::NoResponse => Ok(indication),
            WriteIndication::Failed(error) => Err(error),
        }
    }

    /// The type of a variable or of one of its components.
    #[instrument(skip(self))]
    pub(super) fn get_variable_access_attributes(&self, name: &ObjectName) -> ServiceResult {
        let (domain, item) =
            variable_address(name).ok_or(ServiceError::ACCESS_OBJECT_NON_EXISTENT)?;
        let spec = self
            .server
            .device
            .lookup_variable(domain, item)
            .ok_or(ServiceError::ACCESS_OBJECT_NON_EXISTENT)?;
        Ok(Some(ConfirmedResponse::GetVariableAccessAttributes {
            deletable: false,
            type_spec: spec.clone(),
        }))
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    };

    use super::*;
    use crate::mms::{
        ServerConfig,
        message::{ConfirmedRequest, ConfirmedService, client::ServerMessage},
        server::{
            MmsServer,
            connection::tests::{associated, call, initiate_request},
            tests::test_device,
        },
    };

    const DOMAIN: &str = "ied1Inverter";

    fn item(name: &str) -> VariableAccessItem {
        VariableAccessItem::new(ObjectName::domain(DOMAIN, name))
    }

    fn array_item(access: AlternateAccess) -> VariableAccessItem {
        VariableAccessItem {
            name: ObjectName::domain(DOMAIN, "Samples"),
            alternate_access: Some(access),
        }
    }

    fn component(index: u32, component: &str) -> AlternateAccess {
        AlternateAccess::IndexComponent { index, component: component.to_owned() }
    }

    async fn read(
        connection: &mut MmsServerConnection,
        items: Vec<VariableAccessItem>,
    ) -> Vec<MmsValue> {
        let ServerMessage::Response {
            response: ConfirmedResponse::Read { results, .. },
            ..
        } = call(
            connection,
            1,
            ConfirmedService::Read {
                specification_with_result: false,
                specification: VariableAccessSpecification::ListOfVariable(items),
            },
        )
        .await
        else {
            panic!("not a read response");
        };
        results
    }

    async fn write(
        connection: &mut MmsServerConnection,
        items: Vec<VariableAccessItem>,
        data: Vec<MmsValue>,
    ) -> ServerMessage {
        call(
            connection,
            2,
            ConfirmedService::Write {
                specification: VariableAccessSpecification::ListOfVariable(items),
                data,
            },
        )
        .await
    }

    async fn connect(server: MmsServer) -> MmsServerConnection {
        let mut connection = Arc::new(server).new_connection();
        connection.handle_message(&initiate_request(65000)).await.unwrap();
        connection
    }

    #[tokio::test]
    async fn test_read_from_cache() {
        let mut connection = associated(ServerConfig::default(), 65000).await;
        connection
            .server
            .set_value(DOMAIN, "LLN0$ST$Mod$stVal", &MmsValue::new_i32(5))
            .await
            .unwrap();

        let results = read(
            &mut connection,
            vec![item("LLN0$ST$Mod$stVal"), item("LLN0$ST$Missing"), item("GGIO1$MX$AnIn1$mag$f")],
        )
        .await;
        assert_eq!(
            results,
            [
                MmsValue::new_i32(5),
                MmsValue::new_data_access_error(DataAccessError::ObjectNonExistent),
                MmsValue::new_float(0.0),
            ]
        );

        let vmd = VariableAccessItem::new(ObjectName::VmdSpecific("Vendor".to_owned()));
        assert_eq!(read(&mut connection, vec![vmd]).await, [MmsValue::new_visible_string("")]);
    }

    #[tokio::test]
    async fn test_read_alternate_access() {
        let mut connection = associated(ServerConfig::default(), 65000).await;
        for index in 0..4 {
            connection
                .server
                .set_value(
                    DOMAIN,
                    &format!("Samples${index}$value"),
                    &MmsValue::new_i32(index * 10),
                )
                .await
                .unwrap();
        }

        let results = read(
            &mut connection,
            vec![
                array_item(AlternateAccess::Index(2)),
                array_item(AlternateAccess::IndexRange { low: 1, count: 2 }),
                array_item(component(3, "value")),
                array_item(AlternateAccess::Index(4)),
                array_item(AlternateAccess::IndexRange { low: 3, count: 2 }),
                VariableAccessItem {
                    name: ObjectName::domain(DOMAIN, "LLN0"),
                    alternate_access: Some(AlternateAccess::Index(0)),
                },
            ],
        )
        .await;

        let sample = |value| {
            MmsValue::Structure(vec![MmsValue::new_i32(value), MmsValue::new_boolean(false)])
        };
        let missing = MmsValue::new_data_access_error(DataAccessError::ObjectNonExistent);
        assert_eq!(
            results,
            [
                sample(20),
                MmsValue::Array(vec![sample(10), sample(20)]),
                MmsValue::new_i32(30),
                missing.clone(),
                missing.clone(),
                missing,
            ]
        );
    }

    #[tokio::test]
    async fn test_read_handler_overrides_cache() {
        let server = MmsServer::new(ServerConfig::default(), test_device()).with_read_handler(
            |domain: &str, item: &str, _connection: u64| {
                (domain == DOMAIN && item == "LLN0$ST$Mod$stVal").then(|| MmsValue::new_i32(77))
            },
        );
        let mut connection = connect(server).await;
        let items = vec![item("LLN0$ST$Mod$stVal"), item("LLN0$CF$Mod$ctlModel")];
        let results = read(&mut connection, items).await;
        assert_eq!(results, [MmsValue::new_i32(77), MmsValue::new_i32(0)]);
    }

    #[tokio::test]
    async fn test_read_named_variable_list() {
        let mut connection = associated(ServerConfig::default(), 65000).await;
        let name = ObjectName::domain(DOMAIN, "LLN0$Status");
        let response = call(
            &mut connection,
            4,
            ConfirmedService::Read {
                specification_with_result: true,
                specification: VariableAccessSpecification::VariableListName(name.clone()),
            },
        )
        .await;
        assert_eq!(
            response,
            ServerMessage::Response {
                invoke_id: 4,
                response: ConfirmedResponse::Read {
                    specification: Some(VariableAccessSpecification::VariableListName(name)),
                    results: vec![MmsValue::new_i32(0), MmsValue::new_float(0.0)],
                },
            }
        );

        let response = call(
            &mut connection,
            5,
            ConfirmedService::Read {
                specification_with_result: false,
                specification: VariableAccessSpecification::VariableListName(ObjectName::domain(
                    DOMAIN, "Unknown",
                )),
            },
        )
        .await;
        assert_eq!(
            response,
            ServerMessage::Error { invoke_id: 5, error: ServiceError::ACCESS_OBJECT_NON_EXISTENT }
        );
    }

    #[tokio::test]
    async fn test_write_multiple_with_access_denied() {
        let server = MmsServer::new(ServerConfig::default(), test_device()).with_write_handler(
            |_domain: &str, item: &str, _value: &MmsValue, _connection: u64| {
                if item == "LLN0$CF$Mod$ctlModel" {
                    WriteIndication::Failed(DataAccessError::ObjectAccessDenied)
                } else {
                    WriteIndication::Ok
                }
            },
        );
        let mut connection = connect(server).await;

        let response = write(
            &mut connection,
            vec![item("GGIO1$ST$Ind1$stVal"), item("LLN0$CF$Mod$ctlModel")],
            vec![MmsValue::new_boolean(true), MmsValue::new_i32(42)],
        )
        .await;
        assert_eq!(
            response,
            ServerMessage::Response {
                invoke_id: 2,
                response: ConfirmedResponse::Write(vec![
                    Ok(()),
                    Err(DataAccessError::ObjectAccessDenied)
                ]),
            }
        );
        let server = &connection.server;
        assert_eq!(
            server.get_value(DOMAIN, "GGIO1$ST$Ind1$stVal").await,
            Some(MmsValue::new_boolean(true))
        );
        assert_eq!(
            server.get_value(DOMAIN, "LLN0$CF$Mod$ctlModel").await,
            Some(MmsValue::new_i32(0))
        );
    }

    #[tokio::test]
    async fn test_write_failures() {
        let mut connection = associated(ServerConfig::default(), 65000).await;

        let response = write(
            &mut connection,
            vec![item("LLN0$ST$Mod$stVal"), item("LLN0$ST$Nothing"), item("GGIO1$ST$Ind1$stVal")],
            vec![MmsValue::new_boolean(true), MmsValue::new_i32(1), MmsValue::new_boolean(true)],
        )
        .await;
        assert_eq!(
            response,
            ServerMessage::Response {
                invoke_id: 2,
                response: ConfirmedResponse::Write(vec![
                    Err(DataAccessError::TypeInconsistent),
                    Err(DataAccessError::ObjectNonExistent),
                    Ok(()),
                ]),
            }
        );

        let response = write(&mut connection, vec![item("LLN0$ST$Mod$stVal")], Vec::new()).await;
        let ServerMessage::Reject(reject) = response else {
            panic!("not a reject");
        };
        assert_eq!(reject.invoke_id, Some(2));
        assert_eq!(reject.reason, RejectReason::INVALID_ARGUMENT);
    }

    #[tokio::test]
    async fn test_write_array_elements() {
        let mut connection = associated(ServerConfig::default(), 65000).await;
        let sample = |value, valid| {
            MmsValue::Structure(vec![MmsValue::new_i32(value), MmsValue::new_boolean(valid)])
        };

        let response = write(
            &mut connection,
            vec![
                array_item(AlternateAccess::IndexRange { low: 2, count: 2 }),
                array_item(component(0, "valid")),
                array_item(AlternateAccess::IndexRange { low: 3, count: 2 }),
            ],
            vec![
                MmsValue::Array(vec![sample(5, true), sample(6, false)]),
                MmsValue::new_boolean(true),
                MmsValue::Array(vec![sample(7, true), sample(8, true)]),
            ],
        )
        .await;
        assert_eq!(
            response,
            ServerMessage::Response {
                invoke_id: 2,
                response: ConfirmedResponse::Write(vec![
                    Ok(()),
                    Ok(()),
                    Err(DataAccessError::ObjectNonExistent)
                ]),
            }
        );
        assert_eq!(
            connection.server.get_value(DOMAIN, "Samples").await,
            Some(MmsValue::Array(vec![
                sample(0, true),
                sample(0, false),
                sample(5, true),
                sample(6, false)
            ]))
        );
    }

    #[tokio::test]
    async fn test_write_without_response() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        let server = MmsServer::new(ServerConfig::default(), test_device()).with_write_handler(
            move |_domain: &str, _item: &str, _value: &MmsValue, _connection: u64| {
                counter.fetch_add(1, Ordering::Relaxed);
                WriteIndication::NoResponse
            },
        );
        let mut connection = connect(server).await;
        let request = ConfirmedRequest {
            invoke_id: 9,
            service: ConfirmedService::Write {
                specification: VariableAccessSpecification::ListOfVariable(vec![item(
                    "LLN0$CF$Mod$ctlModel",
                )]),
                data: vec![MmsValue::new_i32(1)],
            },
        }
        .to_ber();
        assert_eq!(connection.handle_message(&request).await, None);
        assert_eq!(calls.load(Ordering::Relaxed), 1);
        assert_eq!(connection.last_invoke_id(), Some(9));
    }

    #[tokio::test]
    async fn test_get_variable_access_attributes() {
        let mut connection = associated(ServerConfig::default(), 65000).await;
        let ServerMessage::Response {
            response: ConfirmedResponse::GetVariableAccessAttributes { deletable, type_spec },
            ..
        } = call(
            &mut connection,
            3,
            ConfirmedService::GetVariableAccessAttributes {
                name: ObjectName::domain(DOMAIN, "LLN0$ST$Mod"),
            },
        )
        .await
        else {
            panic!("not an attributes response");
        };
        assert!(!deletable);
        assert_eq!(type_spec.children().len(), 2);
        assert!(type_spec.get_child("q").is_some());

        let response = call(
            &mut connection,
            3,
            ConfirmedService::GetVariableAccessAttributes {
                name: ObjectName::domain(DOMAIN, "LLN0$XX"),
            },
        )
        .await;
        assert_eq!(
            response,
            ServerMessage::Error { invoke_id: 3, error: ServiceError::ACCESS_OBJECT_NON_EXISTENT }
        );
    }
}
