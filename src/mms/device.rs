//! The MMS object model of a server: the virtual manufacturing device, its domains,
//! their named variables and the named variable lists (data sets).

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::mms::{
    type_spec::{COMPONENT_SEPARATOR, MmsTypeSpec},
    value::MmsValue,
};

/// One member of a named variable list.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct NamedVariableListEntry {
    /// Domain of the variable. Empty for a VMD specific variable.
    pub domain_id: String,
    /// Item name of the variable, possibly with `$` separated components.
    pub item_id: String,
    /// Array element selected by alternate access.
    #[serde(default)]
    pub array_index: Option<u32>,
    /// Component of the array element selected by alternate access.
    #[serde(default)]
    pub component_name: Option<String>,
}

impl NamedVariableListEntry {
    /// An entry naming a whole domain specific variable.
    #[must_use]
    pub fn new(domain_id: impl Into<String>, item_id: impl Into<String>) -> Self {
        Self {
            domain_id: domain_id.into(),
            item_id: item_id.into(),
            array_index: None,
            component_name: None,
        }
    }

    /// Select one element of an array variable.
    #[must_use]
    pub const fn with_array_index(mut self, index: u32) -> Self {
        self.array_index = Some(index);
        self
    }

    /// Select a component of the selected array element.
    #[must_use]
    pub fn with_component(mut self, component: impl Into<String>) -> Self {
        self.component_name = Some(component.into());
        self
    }
}

/// An ordered list of variables. The order is the order of the values on the wire.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NamedVariableList {
    /// The list name.
    pub name: String,
    /// Lists defined by clients can be deleted, static lists can not.
    pub deletable: bool,
    /// The members.
    pub entries: Vec<NamedVariableListEntry>,
}

impl NamedVariableList {
    /// A new list.
    #[must_use]
    pub fn new(
        name: impl Into<String>,
        deletable: bool,
        entries: Vec<NamedVariableListEntry>,
    ) -> Self {
        Self { name: name.into(), deletable, entries }
    }
}

/// Result of deleting a list by name.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ListDeletion {
    /// No list with that name.
    NotFound,
    /// The list exists but is static.
    NotDeletable,
    /// The list was removed.
    Deleted,
}

/// A set of named variable lists of one scope, kept sorted by name.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NamedVariableLists {
    /// The lists.
    lists: Vec<NamedVariableList>,
}

impl NamedVariableLists {
    /// Number of lists.
    #[must_use]
    pub fn len(&self) -> usize {
        self.lists.len()
    }

    /// True if there is no list.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.lists.is_empty()
    }

    /// The list named `name`.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<&NamedVariableList> {
        self.position(name).ok().map(|i| &self.lists[i])
    }

    /// True if a list named `name` exists.
    #[must_use]
    pub fn contains(&self, name: &str) -> bool {
        self.position(name).is_ok()
    }

    /// Insert a list. Returns false, and drops `list`, if the name is taken.
    pub fn add(&mut self, list: NamedVariableList) -> bool {
        match self.position(&list.name) {
            Ok(_) => false,
            Err(i) => {
                self.lists.insert(i, list);
                true
            }
        }
    }

    /// Delete the list named `name` if it is deletable.
    pub fn delete(&mut self, name: &str) -> ListDeletion {
        match self.position(name) {
            Err(_) => ListDeletion::NotFound,
            Ok(i) if !self.lists[i].deletable => ListDeletion::NotDeletable,
            Ok(i) => {
                self.lists.remove(i);
                ListDeletion::Deleted
            }
        }
    }

    /// The list names, sorted.
    #[must_use]
    pub fn names(&self) -> Vec<String> {
        self.lists.iter().map(|list| list.name.clone()).collect()
    }

    /// Iterate over the lists in name order.
    pub fn iter(&self) -> impl Iterator<Item = &NamedVariableList> {
        self.lists.iter()
    }

    fn position(&self, name: &str) -> Result<usize, usize> {
        self.lists.binary_search_by(|list| list.name.as_str().cmp(name))
    }
}

/// Split an item name into the top level variable name and the component path.
#[must_use]
pub fn split_item_name(item: &str) -> (&str, &str) {
    item.split_once(COMPONENT_SEPARATOR).unwrap_or((item, ""))
}

/// Named variables of one scope, kept sorted by name.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
struct Variables(Vec<MmsTypeSpec>);

impl Variables {
    fn add(&mut self, spec: MmsTypeSpec) -> bool {
        match self.0.binary_search_by(|v| v.name.as_str().cmp(&spec.name)) {
            Ok(_) => false,
            Err(i) => {
                self.0.insert(i, spec);
                true
            }
        }
    }

    fn top(&self, name: &str) -> Option<&MmsTypeSpec> {
        self.0
            .binary_search_by(|v| v.name.as_str().cmp(name))
            .ok()
            .map(|i| &self.0[i])
    }

    fn lookup(&self, item: &str) -> Option<&MmsTypeSpec> {
        let (top, rest) = split_item_name(item);
        self.top(top)?.get_named_sub(rest)
    }

    fn flattened_names(&self) -> Vec<String> {
        let mut names = Vec::new();
        for variable in &self.0 {
            names.push(variable.name.clone());
            variable.collect_component_names(&variable.name, &mut names);
        }
        names
    }
}

/// A domain: a named container of variables and lists. A logical device in IEC 61850.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MmsDomain {
    /// The domain name.
    pub name: String,
    /// Top level named variables.
    variables: Variables,
    /// Named variable lists of this domain.
    pub named_variable_lists: NamedVariableLists,
}

impl MmsDomain {
    /// An empty domain.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            variables: Variables::default(),
            named_variable_lists: NamedVariableLists::default(),
        }
    }

    /// Add a top level named variable. Returns false if the name is taken.
    pub fn add_named_variable(&mut self, spec: MmsTypeSpec) -> bool {
        self.variables.add(spec)
    }

    /// Builder form of [`Self::add_named_variable`]. Duplicates are ignored.
    #[must_use]
    pub fn with_named_variable(mut self, spec: MmsTypeSpec) -> Self {
        self.add_named_variable(spec);
        self
    }

    /// Top level named variables, sorted by name.
    #[must_use]
    pub fn named_variables(&self) -> &[MmsTypeSpec] {
        &self.variables.0
    }

    /// Resolve a variable or one of its components by its `$` separated item name.
    #[must_use]
    pub fn get_named_variable(&self, item: &str) -> Option<&MmsTypeSpec> {
        self.variables.lookup(item)
    }

    /// The name of every variable and structure component, depth first.
    #[must_use]
    pub fn named_variable_names(&self) -> Vec<String> {
        self.variables.flattened_names()
    }

    /// Add a named variable list. Returns false if the name is taken.
    pub fn add_named_variable_list(&mut self, list: NamedVariableList) -> bool {
        self.named_variable_lists.add(list)
    }

    /// The named variable list `name`.
    #[must_use]
    pub fn get_named_variable_list(&self, name: &str) -> Option<&NamedVariableList> {
        self.named_variable_lists.get(name)
    }

    /// Delete the named variable list `name` if it is deletable.
    pub fn delete_named_variable_list(&mut self, name: &str) -> ListDeletion {
        self.named_variable_lists.delete(name)
    }
}

/// The virtual manufacturing device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MmsDevice {
    /// The device name.
    pub name: String,
    /// Domains in declaration order.
    domains: Vec<MmsDomain>,
    /// VMD specific named variables.
    variables: Variables,
    /// VMD specific named variable lists.
    pub named_variable_lists: NamedVariableLists,
}

impl MmsDevice {
    /// An empty device.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            domains: Vec::new(),
            variables: Variables::default(),
            named_variable_lists: NamedVariableLists::default(),
        }
    }

    /// Add a domain. Returns false if the name is taken.
    pub fn add_domain(&mut self, domain: MmsDomain) -> bool {
        if self.get_domain(&domain.name).is_some() {
            return false;
        }
        self.domains.push(domain);
        true
    }

    /// Builder form of [`Self::add_domain`]. Duplicates are ignored.
    #[must_use]
    pub fn with_domain(mut self, domain: MmsDomain) -> Self {
        self.add_domain(domain);
        self
    }

    /// The domains in declaration order.
    #[must_use]
    pub fn domains(&self) -> &[MmsDomain] {
        &self.domains
    }

    /// The domain named `name`.
    #[must_use]
    pub fn get_domain(&self, name: &str) -> Option<&MmsDomain> {
        self.domains.iter().find(|domain| domain.name == name)
    }

    /// Mutable access to the domain named `name`.
    pub fn get_domain_mut(&mut self, name: &str) -> Option<&mut MmsDomain> {
        self.domains.iter_mut().find(|domain| domain.name == name)
    }

    /// The domain names in declaration order.
    #[must_use]
    pub fn domain_names(&self) -> Vec<String> {
        self.domains.iter().map(|domain| domain.name.clone()).collect()
    }

    /// Add a VMD specific named variable. Returns false if the name is taken.
    pub fn add_named_variable(&mut self, spec: MmsTypeSpec) -> bool {
        self.variables.add(spec)
    }

    /// Resolve a VMD specific variable by its `$` separated item name.
    #[must_use]
    pub fn get_named_variable(&self, item: &str) -> Option<&MmsTypeSpec> {
        self.variables.lookup(item)
    }

    /// Names of the VMD specific variables and their components, depth first.
    #[must_use]
    pub fn named_variable_names(&self) -> Vec<String> {
        self.variables.flattened_names()
    }

    /// Resolve a variable of the domain `domain`, or of the VMD if `domain` is empty.
    #[must_use]
    pub fn lookup_variable(&self, domain: &str, item: &str) -> Option<&MmsTypeSpec> {
        if domain.is_empty() {
            self.get_named_variable(item)
        } else {
            self.get_domain(domain)?.get_named_variable(item)
        }
    }

    /// The top level type of a variable, used to address the value cache.
    #[must_use]
    pub fn top_level_variable(&self, domain: &str, item: &str) -> Option<&MmsTypeSpec> {
        let (top, _) = split_item_name(item);
        if domain.is_empty() {
            self.variables.top(top)
        } else {
            self.get_domain(domain)?.variables.top(top)
        }
    }

    /// Initial values of every top level variable, keyed by domain and variable name.
    ///
    /// VMD specific variables use an empty domain name.
    #[must_use]
    pub fn create_values(&self) -> HashMap<(String, String), MmsValue> {
        let domain_values = self.domains.iter().flat_map(|domain| {
            domain.variables.0.iter().map(|spec| {
                ((domain.name.clone(), spec.name.clone()), MmsValue::default_for(spec))
            })
        });
        let vmd_values = self
            .variables
            .0
            .iter()
            .map(|spec| ((String::new(), spec.name.clone()), MmsValue::default_for(spec)));
        domain_values.chain(vmd_values).collect()
    }
}
