//
// Copyright (c) The Holo Core Contributors
//
// SPDX-License-Identifier: MIT
//

use std::collections::{BTreeMap, BTreeSet};
use std::net::IpAddr;
use std::sync::Arc;

use ipnetwork::IpNetwork;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::af::RouteFamily;
use crate::error::Error;
use crate::packet::attribute::{Attrs, Comm, CommList, ExtComm, LargeComm};
use crate::path::{Path, PeerInfo};
use crate::rib::TableId;
use crate::validation::{Validation, ValidationStatus};

// Routing policy evaluation, as seen by the route propagation pipeline.
pub trait RoutingPolicy: std::fmt::Debug + Send {
    // Evaluates the import or export policies assigned to the given RIB
    // view. Returns the (possibly modified) path, or `None` if the path was
    // rejected. Withdrawals are never rejected.
    fn apply(
        &self,
        table_id: TableId,
        direction: PolicyDirection,
        path: Path,
        options: &PolicyOptions<'_>,
    ) -> Option<Path>;

    // Replaces the policy assignments of the given RIB views.
    fn reset(
        &mut self,
        assignments: BTreeMap<TableId, PolicyAssignment>,
    ) -> Result<(), Error>;
}

#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
#[derive(Deserialize, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum PolicyDirection {
    Import,
    Export,
}

#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
#[derive(Deserialize, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum DefaultPolicyType {
    #[default]
    AcceptRoute,
    RejectRoute,
}

// Context of a policy evaluation.
#[derive(Clone, Copy, Debug)]
pub struct PolicyOptions<'a> {
    // Neighbor the path was received from (import) or is being sent to
    // (export).
    pub info: &'a PeerInfo,
    // Next hop of the path before the outbound attribute rewrite.
    pub old_nexthop: Option<IpAddr>,
    pub validation: Option<&'a Validation>,
}

// Import and export policy chains of a RIB view.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
#[derive(Deserialize, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct PolicyAssignment {
    pub import_policy: Vec<String>,
    pub default_import_policy: DefaultPolicyType,
    pub export_policy: Vec<String>,
    pub default_export_policy: DefaultPolicyType,
}

#[derive(Clone, Debug, Default, Eq, PartialEq)]
#[derive(Deserialize, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct DefinedSets {
    pub prefixes: BTreeMap<String, BTreeSet<IpPrefixRange>>,
    pub neighbors: BTreeMap<String, BTreeSet<IpNetwork>>,
    pub as_paths: BTreeMap<String, BTreeSet<u32>>,
    pub comms: BTreeMap<String, BTreeSet<Comm>>,
    pub ext_comms: BTreeMap<String, BTreeSet<ExtComm>>,
    pub large_comms: BTreeMap<String, BTreeSet<LargeComm>>,
}

#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
#[derive(Deserialize, Serialize)]
pub struct IpPrefixRange {
    pub prefix: IpNetwork,
    pub masklen_lower: u8,
    pub masklen_upper: u8,
}

#[derive(Clone, Debug, Eq, PartialEq)]
#[derive(Deserialize, Serialize)]
pub struct Policy {
    pub name: String,
    pub stmts: Vec<PolicyStmt>,
}

#[derive(Clone, Debug, Eq, PartialEq)]
#[derive(Deserialize, Serialize)]
pub struct PolicyStmt {
    pub name: String,
    #[serde(default)]
    pub conditions: Vec<PolicyCondition>,
    #[serde(default)]
    pub actions: Vec<PolicyAction>,
}

#[derive(Clone, Debug, Eq, PartialEq)]
#[derive(Deserialize, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum PolicyCondition {
    PrefixSet(String, MatchSetRestrictedType),
    NeighborSet(String, MatchSetRestrictedType),
    AsPathSet(String, MatchSetType),
    OriginAs(BTreeSet<u32>),
    AsPathLength(u32, EqOperator),
    CommSet(String, MatchSetType),
    ExtCommSet(String, MatchSetType),
    LargeCommSet(String, MatchSetType),
    LocalPref(u32, EqOperator),
    Med(u32, EqOperator),
    Rpki(ValidationStatus),
    RouteFamily(BTreeSet<RouteFamily>),
    Nexthop(BTreeSet<IpAddr>),
}

#[derive(Clone, Debug, Eq, PartialEq)]
#[derive(Deserialize, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum PolicyAction {
    Accept,
    Reject,
    SetMed(SetMed),
    SetLocalPref(u32),
    SetComm(SetCommOptions, BTreeSet<Comm>),
    SetExtComm(SetCommOptions, BTreeSet<ExtComm>),
    SetLargeComm(SetCommOptions, BTreeSet<LargeComm>),
    AsPathPrepend { asn: Option<u32>, repeat: u8 },
    SetNexthop(SetNexthop),
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
#[derive(Deserialize, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum MatchSetType {
    Any,
    All,
    Invert,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
#[derive(Deserialize, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum MatchSetRestrictedType {
    Any,
    Invert,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
#[derive(Deserialize, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum EqOperator {
    Equal,
    LessThanOrEqual,
    GreaterThanOrEqual,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
#[derive(Deserialize, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum SetMed {
    Add(u32),
    Subtract(u32),
    Set(u32),
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
#[derive(Deserialize, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum SetCommOptions {
    Add,
    Remove,
    Replace,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
#[derive(Deserialize, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum SetNexthop {
    Addr(IpAddr),
    NexthopSelf,
    PeerAddress,
    Unchanged,
}

// Outcome of a policy chain.
#[derive(Debug)]
enum PolicyResult<T> {
    Accept(T),
    Reject,
    NoMatch(T),
}

// Policy engine: named definitions, defined sets and per-view assignments.
#[derive(Debug, Default)]
pub struct PolicyEngine {
    pub defined_sets: DefinedSets,
    pub policies: BTreeMap<String, Arc<Policy>>,
    pub assignments: BTreeMap<TableId, PolicyAssignment>,
}

// ===== impl PolicyEngine =====

impl PolicyEngine {
    // Replaces the whole policy configuration.
    pub fn set_policies(
        &mut self,
        defined_sets: DefinedSets,
        policies: Vec<Policy>,
        assignments: BTreeMap<TableId, PolicyAssignment>,
    ) -> Result<(), Error> {
        for policy in &policies {
            for stmt in &policy.stmts {
                validate_stmt(&defined_sets, stmt)?;
            }
        }
        let policies = policies
            .into_iter()
            .map(|policy| (policy.name.clone(), Arc::new(policy)))
            .collect::<BTreeMap<_, _>>();
        for assignment in assignments.values() {
            validate_assignment(&policies, assignment)?;
        }

        debug!(policies = policies.len(), "policy configuration replaced");
        self.defined_sets = defined_sets;
        self.policies = policies;
        self.assignments = assignments;
        Ok(())
    }

    pub fn add_policy(&mut self, policy: Policy) -> Result<(), Error> {
        if self.policies.contains_key(&policy.name) {
            return Err(Error::PolicyExists(policy.name));
        }
        for stmt in &policy.stmts {
            validate_stmt(&self.defined_sets, stmt)?;
        }

        debug!(name = %policy.name, "add policy");
        self.policies.insert(policy.name.clone(), Arc::new(policy));
        Ok(())
    }

    // Deletes a policy definition. Policies still assigned to a RIB view
    // can't be deleted.
    pub fn delete_policy(&mut self, name: &str) -> Result<(), Error> {
        if !self.policies.contains_key(name) {
            return Err(Error::PolicyNotFound(name.to_owned()));
        }
        if self.assignments.values().any(|assignment| {
            assignment.import_policy.iter().any(|policy| policy == name)
                || assignment.export_policy.iter().any(|policy| policy == name)
        }) {
            return Err(Error::PolicyInUse(name.to_owned()));
        }

        debug!(%name, "delete policy");
        self.policies.remove(name);
        Ok(())
    }

    // Appends a statement to an existing policy.
    pub fn add_statement(
        &mut self,
        policy: &str,
        stmt: PolicyStmt,
    ) -> Result<(), Error> {
        validate_stmt(&self.defined_sets, &stmt)?;
        let Some(entry) = self.policies.get_mut(policy) else {
            return Err(Error::PolicyNotFound(policy.to_owned()));
        };
        if entry.stmts.iter().any(|other| other.name == stmt.name) {
            return Err(Error::StatementExists(stmt.name));
        }

        debug!(%policy, name = %stmt.name, "add policy statement");
        Arc::make_mut(entry).stmts.push(stmt);
        Ok(())
    }

    // Appends policies to the import or export chain of a RIB view.
    pub fn add_policy_assignment(
        &mut self,
        table_id: TableId,
        direction: PolicyDirection,
        policies: Vec<String>,
        default: DefaultPolicyType,
    ) -> Result<(), Error> {
        if let Some(name) =
            policies.iter().find(|name| !self.policies.contains_key(*name))
        {
            return Err(Error::PolicyNotFound(name.clone()));
        }

        debug!(%table_id, ?direction, ?policies, "add policy assignment");
        let assignment = self.assignments.entry(table_id).or_default();
        let (chain, dflt) = assignment.chain_mut(direction);
        for name in policies {
            if !chain.contains(&name) {
                chain.push(name);
            }
        }
        *dflt = default;
        Ok(())
    }

    // Removes policies from the import or export chain of a RIB view. When
    // no policy is given the whole chain is removed and the default action
    // is reset.
    pub fn delete_policy_assignment(
        &mut self,
        table_id: TableId,
        direction: PolicyDirection,
        policies: &[String],
    ) -> Result<(), Error> {
        let Some(assignment) = self.assignments.get_mut(&table_id) else {
            return Ok(());
        };

        debug!(%table_id, ?direction, ?policies, "delete policy assignment");
        let (chain, dflt) = assignment.chain_mut(direction);
        if policies.is_empty() {
            chain.clear();
            *dflt = DefaultPolicyType::default();
        } else {
            chain.retain(|name| !policies.contains(name));
        }
        if *assignment == PolicyAssignment::default() {
            self.assignments.remove(&table_id);
        }
        Ok(())
    }

    // Returns the named policy, or all policies.
    pub fn list_policy(
        &self,
        name: Option<&str>,
    ) -> Result<Vec<Arc<Policy>>, Error> {
        match name {
            Some(name) => self
                .policies
                .get(name)
                .map(|policy| vec![policy.clone()])
                .ok_or_else(|| Error::PolicyNotFound(name.to_owned())),
            None => Ok(self.policies.values().cloned().collect()),
        }
    }

    pub fn assignment(
        &self,
        table_id: TableId,
    ) -> Option<&PolicyAssignment> {
        self.assignments.get(&table_id)
    }

    fn process_policies(
        &self,
        policies: &[String],
        mut path: Path,
        options: &PolicyOptions<'_>,
    ) -> PolicyResult<Path> {
        let mut attrs: Option<Attrs> = None;

        for stmt in policies
            .iter()
            .filter_map(|name| self.policies.get(name))
            .flat_map(|policy| policy.stmts.iter())
        {
            let current = attrs.as_ref().unwrap_or(&path.attrs);
            // Check if all conditions in the policy statement are satisfied.
            if !stmt.conditions.iter().all(|condition| {
                self.process_stmt_condition(&path, current, condition, options)
            }) {
                continue;
            }

            // Process actions defined in the policy statement.
            for action in &stmt.actions {
                match action {
                    PolicyAction::Accept => {
                        if let Some(attrs) = attrs {
                            path = path.with_attrs(attrs);
                        }
                        return PolicyResult::Accept(path);
                    }
                    PolicyAction::Reject => return PolicyResult::Reject,
                    _ => {
                        let attrs = attrs
                            .get_or_insert_with(|| (*path.attrs).clone());
                        process_stmt_action(attrs, action, options);
                    }
                }
            }
        }

        // Statements without a route disposition fall through to the default
        // policy, keeping their modifications.
        if let Some(attrs) = attrs {
            path = path.with_attrs(attrs);
        }
        PolicyResult::NoMatch(path)
    }

    fn process_stmt_condition(
        &self,
        path: &Path,
        attrs: &Attrs,
        condition: &PolicyCondition,
        options: &PolicyOptions<'_>,
    ) -> bool {
        let sets = &self.defined_sets;
        match condition {
            PolicyCondition::PrefixSet(name, match_type) => {
                let Some(prefix) = path.nlri.prefix() else {
                    return false;
                };
                let Some(ranges) = sets.prefixes.get(name) else {
                    return false;
                };
                let found = ranges.iter().any(|range| range.contains(&prefix));
                match_type.compare(found)
            }
            PolicyCondition::NeighborSet(name, match_type) => {
                let Some(addr) = options.info.address else {
                    return false;
                };
                let Some(neighbors) = sets.neighbors.get(name) else {
                    return false;
                };
                let found = neighbors.iter().any(|net| net.contains(addr));
                match_type.compare(found)
            }
            PolicyCondition::AsPathSet(name, match_type) => {
                let Some(asns) = sets.as_paths.get(name) else {
                    return false;
                };
                let as_path =
                    attrs.base.as_path.iter().collect::<BTreeSet<_>>();
                match_type.compare(&as_path, asns)
            }
            PolicyCondition::OriginAs(asns) => attrs
                .base
                .as_path
                .origin()
                .is_some_and(|asn| asns.contains(&asn)),
            PolicyCondition::AsPathLength(value, op) => {
                op.compare(&attrs.base.as_path.path_length(), value)
            }
            PolicyCondition::CommSet(name, match_type) => {
                let Some(comms) = sets.comms.get(name) else {
                    return false;
                };
                match_comm_set(&attrs.comm, comms, *match_type)
            }
            PolicyCondition::ExtCommSet(name, match_type) => {
                let Some(comms) = sets.ext_comms.get(name) else {
                    return false;
                };
                match_comm_set(&attrs.ext_comm, comms, *match_type)
            }
            PolicyCondition::LargeCommSet(name, match_type) => {
                let Some(comms) = sets.large_comms.get(name) else {
                    return false;
                };
                match_comm_set(&attrs.large_comm, comms, *match_type)
            }
            PolicyCondition::LocalPref(value, op) => attrs
                .base
                .local_pref
                .is_some_and(|local_pref| op.compare(&local_pref, value)),
            PolicyCondition::Med(value, op) => attrs
                .base
                .med
                .is_some_and(|med| op.compare(&med, value)),
            PolicyCondition::Rpki(status) => {
                let validation =
                    options.validation.or(path.validation.as_deref());
                let current = validation
                    .map(|validation| validation.status)
                    .unwrap_or(ValidationStatus::NotFound);
                current == *status
            }
            PolicyCondition::RouteFamily(families) => {
                families.contains(&path.family())
            }
            PolicyCondition::Nexthop(addrs) => attrs
                .base
                .nexthop
                .is_some_and(|nexthop| addrs.contains(&nexthop)),
        }
    }
}

impl RoutingPolicy for PolicyEngine {
    fn apply(
        &self,
        table_id: TableId,
        direction: PolicyDirection,
        path: Path,
        options: &PolicyOptions<'_>,
    ) -> Option<Path> {
        if path.is_withdraw() {
            return Some(path);
        }
        let Some(assignment) = self.assignments.get(&table_id) else {
            return Some(path);
        };
        let (policies, default) = assignment.chain(direction);

        match self.process_policies(policies, path, options) {
            PolicyResult::Accept(path) => Some(path),
            PolicyResult::Reject => None,
            PolicyResult::NoMatch(path) => match default {
                DefaultPolicyType::AcceptRoute => Some(path),
                DefaultPolicyType::RejectRoute => None,
            },
        }
    }

    fn reset(
        &mut self,
        assignments: BTreeMap<TableId, PolicyAssignment>,
    ) -> Result<(), Error> {
        for assignment in assignments.values() {
            validate_assignment(&self.policies, assignment)?;
        }
        for (table_id, assignment) in assignments {
            if assignment == PolicyAssignment::default() {
                self.assignments.remove(&table_id);
            } else {
                self.assignments.insert(table_id, assignment);
            }
        }
        Ok(())
    }
}

// ===== impl PolicyAssignment =====

impl PolicyAssignment {
    fn chain(
        &self,
        direction: PolicyDirection,
    ) -> (&[String], DefaultPolicyType) {
        match direction {
            PolicyDirection::Import => {
                (&self.import_policy, self.default_import_policy)
            }
            PolicyDirection::Export => {
                (&self.export_policy, self.default_export_policy)
            }
        }
    }

    fn chain_mut(
        &mut self,
        direction: PolicyDirection,
    ) -> (&mut Vec<String>, &mut DefaultPolicyType) {
        match direction {
            PolicyDirection::Import => (
                &mut self.import_policy,
                &mut self.default_import_policy,
            ),
            PolicyDirection::Export => (
                &mut self.export_policy,
                &mut self.default_export_policy,
            ),
        }
    }
}

// ===== impl IpPrefixRange =====

impl IpPrefixRange {
    pub fn exact(prefix: IpNetwork) -> IpPrefixRange {
        IpPrefixRange {
            prefix,
            masklen_lower: prefix.prefix(),
            masklen_upper: prefix.prefix(),
        }
    }

    // Returns whether the prefix is covered by the range and its length is
    // within the configured bounds.
    pub fn contains(&self, prefix: &IpNetwork) -> bool {
        let len = prefix.prefix();
        self.prefix.is_ipv4() == prefix.is_ipv4()
            && self.prefix.prefix() <= len
            && self.prefix.contains(prefix.network())
            && (self.masklen_lower..=self.masklen_upper).contains(&len)
    }
}

// ===== impl MatchSetType =====

impl MatchSetType {
    pub fn compare<T>(&self, a: &BTreeSet<T>, b: &BTreeSet<T>) -> bool
    where
        T: Eq + Ord + PartialEq + PartialOrd,
    {
        match self {
            MatchSetType::Any => !a.is_disjoint(b),
            MatchSetType::All => a.is_superset(b),
            MatchSetType::Invert => a.is_disjoint(b),
        }
    }
}

// ===== impl MatchSetRestrictedType =====

impl MatchSetRestrictedType {
    pub fn compare(&self, found: bool) -> bool {
        match self {
            MatchSetRestrictedType::Any => found,
            MatchSetRestrictedType::Invert => !found,
        }
    }
}

// ===== impl EqOperator =====

impl EqOperator {
    pub fn compare<T>(&self, a: &T, b: &T) -> bool
    where
        T: Eq + Ord + PartialEq + PartialOrd,
    {
        match self {
            EqOperator::Equal => *a == *b,
            EqOperator::LessThanOrEqual => *a <= *b,
            EqOperator::GreaterThanOrEqual => *a >= *b,
        }
    }
}

// ===== helper functions =====

fn validate_stmt(sets: &DefinedSets, stmt: &PolicyStmt) -> Result<(), Error> {
    for condition in &stmt.conditions {
        let (name, found) = match condition {
            PolicyCondition::PrefixSet(name, _) => {
                (name, sets.prefixes.contains_key(name))
            }
            PolicyCondition::NeighborSet(name, _) => {
                (name, sets.neighbors.contains_key(name))
            }
            PolicyCondition::AsPathSet(name, _) => {
                (name, sets.as_paths.contains_key(name))
            }
            PolicyCondition::CommSet(name, _) => {
                (name, sets.comms.contains_key(name))
            }
            PolicyCondition::ExtCommSet(name, _) => {
                (name, sets.ext_comms.contains_key(name))
            }
            PolicyCondition::LargeCommSet(name, _) => {
                (name, sets.large_comms.contains_key(name))
            }
            _ => continue,
        };
        if !found {
            return Err(Error::DefinedSetNotFound(name.clone()));
        }
    }
    Ok(())
}

fn validate_assignment(
    policies: &BTreeMap<String, Arc<Policy>>,
    assignment: &PolicyAssignment,
) -> Result<(), Error> {
    match assignment
        .import_policy
        .iter()
        .chain(assignment.export_policy.iter())
        .find(|name| !policies.contains_key(*name))
    {
        Some(name) => Err(Error::PolicyNotFound(name.clone())),
        None => Ok(()),
    }
}

fn match_comm_set<T>(
    comm_list: &Option<CommList<T>>,
    set: &BTreeSet<T>,
    match_type: MatchSetType,
) -> bool
where
    T: Eq + Ord + PartialEq + PartialOrd,
{
    let empty = BTreeSet::new();
    let comms = comm_list.as_ref().map(|list| &list.0).unwrap_or(&empty);
    match_type.compare(comms, set)
}

fn process_stmt_action(
    attrs: &mut Attrs,
    action: &PolicyAction,
    options: &PolicyOptions<'_>,
) {
    match action {
        PolicyAction::Accept | PolicyAction::Reject => (),
        PolicyAction::SetMed(set_med) => {
            let med = attrs.base.med.unwrap_or(0);
            attrs.base.med = Some(match set_med {
                SetMed::Add(value) => med.saturating_add(*value),
                SetMed::Subtract(value) => med.saturating_sub(*value),
                SetMed::Set(value) => *value,
            });
        }
        PolicyAction::SetLocalPref(value) => {
            attrs.base.local_pref = Some(*value);
        }
        PolicyAction::SetComm(set_options, comms) => {
            action_set_comm(set_options, comms, &mut attrs.comm);
        }
        PolicyAction::SetExtComm(set_options, comms) => {
            action_set_comm(set_options, comms, &mut attrs.ext_comm);
        }
        PolicyAction::SetLargeComm(set_options, comms) => {
            action_set_comm(set_options, comms, &mut attrs.large_comm);
        }
        PolicyAction::AsPathPrepend { asn, repeat } => {
            let asn = asn.unwrap_or(options.info.local_as);
            for _ in 0..*repeat {
                attrs.base.as_path.prepend(asn);
            }
        }
        PolicyAction::SetNexthop(set_nexthop) => {
            let nexthop = match set_nexthop {
                SetNexthop::Addr(addr) => Some(*addr),
                SetNexthop::NexthopSelf => options.info.local_address,
                SetNexthop::PeerAddress => options.info.address,
                SetNexthop::Unchanged => options.old_nexthop,
            };
            if let Some(nexthop) = nexthop {
                attrs.base.nexthop = Some(nexthop);
            }
        }
    }
}

fn action_set_comm<T>(
    options: &SetCommOptions,
    comms: &BTreeSet<T>,
    comm_list: &mut Option<CommList<T>>,
) where
    T: Clone + Ord,
{
    // Add, remove or replace communities.
    match options {
        SetCommOptions::Add => {
            if let Some(comm_list) = comm_list {
                comm_list.0.extend(comms.iter().cloned());
            } else {
                *comm_list = Some(CommList(comms.clone()));
            }
        }
        SetCommOptions::Remove => {
            if let Some(comm_list) = comm_list {
                comm_list.0.retain(|c| !comms.contains(c))
            }
        }
        SetCommOptions::Replace => {
            *comm_list = Some(CommList(comms.clone()));
        }
    }

    // Remove the community list if it exists and is empty.
    if let Some(list) = comm_list.as_ref()
        && list.0.is_empty()
    {
        *comm_list = None;
    }
}

// ===== unit tests =====

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packet::nlri::Nlri;

    fn peer() -> PeerInfo {
        PeerInfo {
            asn: 65001,
            local_as: 65000,
            id: "1.1.1.1".parse().unwrap(),
            local_id: "9.9.9.9".parse().unwrap(),
            address: Some("192.0.2.1".parse().unwrap()),
            local_address: Some("192.0.2.9".parse().unwrap()),
            route_reflector_client: false,
            route_reflector_cluster_id: "9.9.9.9".parse().unwrap(),
        }
    }

    fn path(prefix: &str) -> Path {
        let mut attrs = Attrs::default();
        attrs.base.as_path =
            crate::packet::attribute::AsPath::from_sequence([65001, 65100]);
        attrs.base.nexthop = Some("192.0.2.1".parse().unwrap());
        Path::new(
            Arc::new(peer()),
            Nlri::from(prefix.parse::<IpNetwork>().unwrap()),
            0,
            Arc::new(attrs),
            false,
        )
    }

    fn engine() -> PolicyEngine {
        let mut sets = DefinedSets::default();
        sets.prefixes.insert(
            "ten".to_owned(),
            [IpPrefixRange {
                prefix: "10.0.0.0/8".parse().unwrap(),
                masklen_lower: 16,
                masklen_upper: 24,
            }]
            .into(),
        );
        sets.as_paths.insert("transit".to_owned(), [65100].into());

        let policies = vec![
            Policy {
                name: "deny-ten".to_owned(),
                stmts: vec![PolicyStmt {
                    name: "s1".to_owned(),
                    conditions: vec![PolicyCondition::PrefixSet(
                        "ten".to_owned(),
                        MatchSetRestrictedType::Any,
                    )],
                    actions: vec![PolicyAction::Reject],
                }],
            },
            Policy {
                name: "prefer-transit".to_owned(),
                stmts: vec![PolicyStmt {
                    name: "s1".to_owned(),
                    conditions: vec![PolicyCondition::AsPathSet(
                        "transit".to_owned(),
                        MatchSetType::Any,
                    )],
                    actions: vec![
                        PolicyAction::SetLocalPref(200),
                        PolicyAction::SetComm(
                            SetCommOptions::Add,
                            [Comm(0xfde8_0001)].into(),
                        ),
                    ],
                }],
            },
        ];

        let mut engine = PolicyEngine::default();
        engine
            .set_policies(sets, policies, Default::default())
            .unwrap();
        engine
    }

    #[test]
    fn prefix_range() {
        let range = IpPrefixRange {
            prefix: "10.0.0.0/8".parse().unwrap(),
            masklen_lower: 16,
            masklen_upper: 24,
        };
        assert!(range.contains(&"10.1.0.0/16".parse().unwrap()));
        assert!(range.contains(&"10.1.2.0/24".parse().unwrap()));
        assert!(!range.contains(&"10.0.0.0/8".parse().unwrap()));
        assert!(!range.contains(&"10.1.2.128/25".parse().unwrap()));
        assert!(!range.contains(&"11.0.0.0/16".parse().unwrap()));
        assert!(!range.contains(&"::/16".parse().unwrap()));
    }

    #[test]
    fn import_chain() {
        let mut engine = engine();
        let info = peer();
        let options = PolicyOptions {
            info: &info,
            old_nexthop: None,
            validation: None,
        };

        // Without assignments everything is accepted.
        let table_id = TableId::Global;
        let dir = PolicyDirection::Import;
        let accepted =
            engine.apply(table_id, dir, path("10.1.0.0/16"), &options);
        assert!(accepted.is_some());

        engine
            .add_policy_assignment(
                table_id,
                dir,
                vec!["deny-ten".to_owned(), "prefer-transit".to_owned()],
                DefaultPolicyType::AcceptRoute,
            )
            .unwrap();
        let rejected =
            engine.apply(table_id, dir, path("10.1.0.0/16"), &options);
        assert!(rejected.is_none());

        // Withdrawals always pass.
        let withdrawal = path("10.1.0.0/16").as_withdrawal();
        assert!(engine.apply(table_id, dir, withdrawal, &options).is_some());

        // Modifications are kept by the default action.
        let accepted = engine
            .apply(table_id, dir, path("172.16.0.0/16"), &options)
            .unwrap();
        assert_eq!(accepted.attrs.base.local_pref, Some(200));
        assert!(accepted.attrs.has_comm(0xfde8_0001));

        // Export direction isn't affected.
        let export = PolicyDirection::Export;
        let exported =
            engine.apply(table_id, export, path("10.1.0.0/16"), &options);
        assert!(exported.is_some());

        engine
            .delete_policy_assignment(table_id, dir, &[])
            .unwrap();
        assert!(engine.assignment(table_id).is_none());
    }

    #[test]
    fn default_reject() {
        let mut engine = engine();
        let info = peer();
        let options = PolicyOptions {
            info: &info,
            old_nexthop: None,
            validation: None,
        };
        let table_id =
            TableId::RouteServerClient("192.0.2.1".parse().unwrap());
        engine
            .add_policy_assignment(
                table_id,
                PolicyDirection::Export,
                vec!["prefer-transit".to_owned()],
                DefaultPolicyType::RejectRoute,
            )
            .unwrap();
        let export = PolicyDirection::Export;
        let rejected =
            engine.apply(table_id, export, path("10.1.0.0/16"), &options);
        assert!(rejected.is_none());
        let table_id = TableId::Global;
        let accepted =
            engine.apply(table_id, export, path("10.1.0.0/16"), &options);
        assert!(accepted.is_some());
    }

    #[test]
    fn nexthop_actions() {
        let mut engine = engine();
        let info = peer();
        let options = PolicyOptions {
            info: &info,
            old_nexthop: Some("203.0.113.1".parse().unwrap()),
            validation: None,
        };
        engine
            .add_policy(Policy {
                name: "nh".to_owned(),
                stmts: vec![],
            })
            .unwrap();
        engine
            .add_statement(
                "nh",
                PolicyStmt {
                    name: "unchanged".to_owned(),
                    conditions: vec![],
                    actions: vec![
                        PolicyAction::SetNexthop(SetNexthop::Unchanged),
                        PolicyAction::AsPathPrepend {
                            asn: None,
                            repeat: 2,
                        },
                        PolicyAction::Accept,
                    ],
                },
            )
            .unwrap();
        assert!(matches!(
            engine.add_statement(
                "nh",
                PolicyStmt {
                    name: "unchanged".to_owned(),
                    conditions: vec![],
                    actions: vec![],
                }
            ),
            Err(Error::StatementExists(_))
        ));
        engine
            .add_policy_assignment(
                TableId::Global,
                PolicyDirection::Export,
                vec!["nh".to_owned()],
                DefaultPolicyType::RejectRoute,
            )
            .unwrap();

        let path = engine
            .apply(
                TableId::Global,
                PolicyDirection::Export,
                path("192.168.0.0/24"),
                &options,
            )
            .unwrap();
        assert_eq!(path.nexthop(), "203.0.113.1".parse().ok());
        assert_eq!(path.attrs.base.as_path.path_length(), 4);
        assert_eq!(path.attrs.base.as_path.first(), Some(65000));
    }

    #[test]
    fn management_errors() {
        let mut engine = engine();
        assert!(matches!(
            engine.add_policy(Policy {
                name: "deny-ten".to_owned(),
                stmts: vec![],
            }),
            Err(Error::PolicyExists(_))
        ));
        assert!(matches!(
            engine.add_policy(Policy {
                name: "bad".to_owned(),
                stmts: vec![PolicyStmt {
                    name: "s1".to_owned(),
                    conditions: vec![PolicyCondition::CommSet(
                        "missing".to_owned(),
                        MatchSetType::Any,
                    )],
                    actions: vec![],
                }],
            }),
            Err(Error::DefinedSetNotFound(_))
        ));
        assert!(matches!(
            engine.add_policy_assignment(
                TableId::Global,
                PolicyDirection::Import,
                vec!["missing".to_owned()],
                DefaultPolicyType::AcceptRoute,
            ),
            Err(Error::PolicyNotFound(_))
        ));

        engine
            .add_policy_assignment(
                TableId::Global,
                PolicyDirection::Import,
                vec!["deny-ten".to_owned()],
                DefaultPolicyType::AcceptRoute,
            )
            .unwrap();
        assert!(matches!(
            engine.delete_policy("deny-ten"),
            Err(Error::PolicyInUse(_))
        ));
        engine.delete_policy("prefer-transit").unwrap();
        assert_eq!(engine.list_policy(None).unwrap().len(), 1);
        assert!(engine.list_policy(Some("prefer-transit")).is_err());
    }
}
