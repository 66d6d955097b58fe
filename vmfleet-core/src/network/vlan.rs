//! VLAN tag allocation
//!
//! Tags are handed out either explicitly (an integer in a netspec) or through
//! a namespace-qualified alias such as `prod//lan1`. Once a tag has been
//! handed out it is never given to a different alias again, not even after
//! its namespace is deleted.

use parking_lot::Mutex;
use std::collections::HashMap;
use tracing::{debug, info, instrument, warn};

use crate::error::{FleetError, FleetResult};
use crate::metrics::{names, MetricsRegistry};

/// Separates a namespace from an alias
pub const ALIAS_SEP: &str = "//";

/// Alias recorded for tags that were requested by number
pub const BLACKLISTED: &str = "BLACKLISTED";

#[derive(Debug)]
struct VlanTable {
    by_alias: HashMap<String, i32>,
    by_tag: HashMap<i32, String>,
    next: i32,
}

/// Process-wide alias and blacklist table
#[derive(Debug)]
pub struct VlanAllocator {
    min: i32,
    max: i32,
    table: Mutex<VlanTable>,
    metrics: MetricsRegistry,
}

/// Qualifies a bare alias with its namespace
pub fn qualify_alias(namespace: &str, alias: &str) -> String {
    if alias.contains(ALIAS_SEP) {
        alias.to_string()
    } else {
        format!("{}{}{}", namespace, ALIAS_SEP, alias)
    }
}

/// Validates a VLAN token without allocating anything
pub fn check_vlan_token(token: &str) -> FleetResult<()> {
    let token = token.trim();
    if token.is_empty() {
        return Err(FleetError::invalid_input("vlan", "empty VLAN"));
    }
    match token.parse::<i32>() {
        Ok(tag) if !(1..=4095).contains(&tag) => Err(FleetError::invalid_input(
            "vlan",
            format!("VLAN out of range: {}", tag),
        )),
        _ => Ok(()),
    }
}

impl VlanAllocator {
    pub fn new(min: i32, max: i32) -> Self {
        Self::with_metrics(min, max, MetricsRegistry::new())
    }

    pub fn with_metrics(min: i32, max: i32, metrics: MetricsRegistry) -> Self {
        Self {
            min,
            max,
            table: Mutex::new(VlanTable {
                by_alias: HashMap::new(),
                by_tag: HashMap::new(),
                next: min,
            }),
            metrics,
        }
    }

    /// Returns the tag for a fully qualified alias, allocating one on first use
    #[instrument(skip(self))]
    pub fn get_or_allocate(&self, alias: &str) -> FleetResult<i32> {
        let mut table = self.table.lock();

        if let Some(tag) = table.by_alias.get(alias) {
            return Ok(*tag);
        }

        let mut candidate = table.next;
        while candidate <= self.max && table.by_tag.contains_key(&candidate) {
            candidate += 1;
        }
        if candidate > self.max {
            return Err(FleetError::ResourceExhausted {
                resource: format!("VLANs in range {}-{}", self.min, self.max),
            });
        }

        table.by_alias.insert(alias.to_string(), candidate);
        table.by_tag.insert(candidate, alias.to_string());
        table.next = candidate + 1;
        self.metrics.increment_counter(names::VLAN_ALLOCATED);

        info!("allocated VLAN {} for alias {}", candidate, alias);
        Ok(candidate)
    }

    /// Alias a tag was allocated for, or [`BLACKLISTED`]
    pub fn get_alias(&self, tag: i32) -> Option<String> {
        self.table.lock().by_tag.get(&tag).cloned()
    }

    /// Marks a tag unavailable for alias allocation
    pub fn blacklist(&self, tag: i32) {
        let mut table = self.table.lock();
        table
            .by_tag
            .entry(tag)
            .or_insert_with(|| BLACKLISTED.to_string());
        debug!("blacklisted VLAN {}", tag);
    }

    /// Resolves a VLAN token from a netspec or command.
    ///
    /// Integers are taken as explicit tags and blacklisted; anything else is
    /// an alias in `namespace`.
    pub fn parse_vlan(&self, namespace: &str, token: &str) -> FleetResult<i32> {
        let token = token.trim();
        check_vlan_token(token)?;

        match token.parse::<i32>() {
            Ok(tag) => {
                if let Some(alias) = self.get_alias(tag) {
                    if alias != BLACKLISTED {
                        warn!("VLAN {} has alias {}", tag, alias);
                    }
                }
                self.blacklist(tag);
                Ok(tag)
            }
            Err(_) => self.get_or_allocate(&qualify_alias(namespace, token)),
        }
    }

    /// Aliases in a namespace (all namespaces when `None`), sorted by tag
    pub fn aliases(&self, namespace: Option<&str>) -> Vec<(String, i32)> {
        let table = self.table.lock();
        let mut aliases: Vec<(String, i32)> = table
            .by_alias
            .iter()
            .filter(|(alias, _)| match namespace {
                Some(ns) => alias.starts_with(&format!("{}{}", ns, ALIAS_SEP)),
                None => true,
            })
            .map(|(alias, tag)| (alias.clone(), *tag))
            .collect();
        aliases.sort_by_key(|(_, tag)| *tag);
        aliases
    }

    /// Forgets a namespace's aliases. Their tags stay blacklisted.
    pub fn delete_namespace(&self, namespace: &str) -> usize {
        let prefix = format!("{}{}", namespace, ALIAS_SEP);
        let mut table = self.table.lock();

        let doomed: Vec<String> = table
            .by_alias
            .keys()
            .filter(|alias| alias.starts_with(&prefix))
            .cloned()
            .collect();

        for alias in &doomed {
            if let Some(tag) = table.by_alias.remove(alias) {
                table.by_tag.insert(tag, BLACKLISTED.to_string());
            }
        }

        info!(
            "deleted {} VLAN aliases for namespace {}",
            doomed.len(),
            namespace
        );
        doomed.len()
    }
}
