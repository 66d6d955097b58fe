//! Target expressions and batch application
//!
//! A target is a name, an id, a comma separated list of either, a bracketed
//! range such as `web[01-10,15]`, or the wildcard `all`. Expansion happens
//! once against a registry snapshot and the operation then runs on every
//! match independently.

use futures::future::join_all;
use std::future::Future;
use std::sync::Arc;
use tracing::debug;

use crate::error::{FleetError, FleetResult};
use crate::registry::VmRegistry;
use crate::types::{VmId, VmState};
use crate::vm::Vm;

/// Selects every visible VM whose state matches the operation's mask
pub const WILDCARD: &str = "all";

pub const START_MASK: VmState = VmState::PAUSED;
pub const STOP_MASK: VmState = VmState::RUNNING;
pub const KILL_MASK: VmState = VmState::KILLABLE;
pub const TAG_MASK: VmState = VmState::ANY;

/// Most names one expression, or one count launch, may expand to
pub const MAX_EXPANSION: usize = 4096;

/// Per-target result of a batch operation
#[derive(Debug)]
pub struct TargetOutcome<T = ()> {
    pub target: String,
    pub result: FleetResult<T>,
}

impl<T> TargetOutcome<T> {
    pub fn is_ok(&self) -> bool {
        self.result.is_ok()
    }
}

fn malformed(expr: &str, message: impl Into<String>) -> FleetError {
    FleetError::invalid_input("target", format!("{}: {}", expr, message.into()))
}

/// Splits on commas that are not inside brackets
fn split_top_level(expr: &str) -> FleetResult<Vec<&str>> {
    let mut parts = Vec::new();
    let mut depth = 0usize;
    let mut start = 0;

    for (i, c) in expr.char_indices() {
        match c {
            '[' if depth > 0 => return Err(malformed(expr, "nested brackets")),
            '[' => depth += 1,
            ']' if depth == 0 => return Err(malformed(expr, "unbalanced brackets")),
            ']' => depth -= 1,
            ',' if depth == 0 => {
                parts.push(&expr[start..i]);
                start = i + 1;
            }
            _ => {}
        }
    }
    if depth != 0 {
        return Err(malformed(expr, "unbalanced brackets"));
    }
    parts.push(&expr[start..]);
    Ok(parts)
}

fn too_many(expr: &str) -> FleetError {
    malformed(expr, format!("expands to more than {} names", MAX_EXPANSION))
}

fn parse_bound(expr: &str, s: &str) -> FleetResult<u64> {
    if s.is_empty() || !s.bytes().all(|b| b.is_ascii_digit()) {
        return Err(malformed(expr, format!("`{}` is not a number", s)));
    }
    s.parse()
        .map_err(|_| malformed(expr, format!("`{}` is out of range", s)))
}

fn expand_range(part: &str) -> FleetResult<Vec<String>> {
    let Some(open) = part.find('[') else {
        return Ok(vec![part.to_string()]);
    };
    if !part.ends_with(']') {
        return Err(malformed(part, "text after range"));
    }

    let prefix = &part[..open];
    let body = &part[open + 1..part.len() - 1];
    let mut names = Vec::new();

    for item in body.split(',') {
        match item.split_once('-') {
            Some((lo_str, hi_str)) => {
                let lo = parse_bound(part, lo_str)?;
                let hi = parse_bound(part, hi_str)?;
                if lo > hi {
                    return Err(malformed(part, format!("inverted range {}", item)));
                }
                let total = (hi - lo)
                    .saturating_add(1)
                    .saturating_add(names.len() as u64);
                if total > MAX_EXPANSION as u64 {
                    return Err(too_many(part));
                }
                let width = if lo_str.len() > 1 && lo_str.starts_with('0') {
                    lo_str.len()
                } else {
                    0
                };
                names.extend((lo..=hi).map(|n| format!("{}{:0width$}", prefix, n, width = width)));
            }
            None => {
                parse_bound(part, item)?;
                names.push(format!("{}{}", prefix, item));
            }
        }
    }

    Ok(names)
}

/// Expands a list or range expression into individual targets, in order
pub fn expand_list(expr: &str) -> FleetResult<Vec<String>> {
    if expr.is_empty() {
        return Err(malformed(expr, "empty target"));
    }

    let mut targets = Vec::new();
    for part in split_top_level(expr)? {
        if part.is_empty() {
            return Err(malformed(expr, "empty list element"));
        }
        targets.extend(expand_range(part)?);
        if targets.len() > MAX_EXPANSION {
            return Err(too_many(expr));
        }
    }
    Ok(targets)
}

/// Checks that a target expression is well formed without resolving it
pub fn check_target(expr: &str) -> FleetResult<()> {
    if expr != WILDCARD {
        expand_list(expr)?;
    }
    Ok(())
}

/// Names for `vm launch`: a positive integer `n` means n auto-named VMs
pub fn expand_launch_names(arg: &str) -> FleetResult<Vec<String>> {
    match arg.parse::<usize>() {
        Ok(0) => Err(FleetError::invalid_input("name", "must launch at least one VM")),
        Ok(n) if n > MAX_EXPANSION => Err(FleetError::invalid_input(
            "name",
            format!("cannot launch more than {} VMs at once", MAX_EXPANSION),
        )),
        Ok(n) => Ok(vec![String::new(); n]),
        Err(_) => expand_list(arg),
    }
}

fn lookup(snapshot: &[Arc<dyn Vm>], target: &str) -> FleetResult<Arc<dyn Vm>> {
    if let Ok(id) = target.parse::<VmId>() {
        if let Some(vm) = snapshot.iter().find(|vm| vm.id() == id) {
            return Ok(vm.clone());
        }
    }
    snapshot
        .iter()
        .find(|vm| vm.name() == target)
        .cloned()
        .ok_or_else(|| FleetError::vm_not_found(target))
}

impl VmRegistry {
    /// Resolves a target expression against one snapshot of the registry.
    ///
    /// Explicit targets that match nothing come back as not-found entries;
    /// only a malformed expression fails the whole call.
    pub fn resolve(
        &self,
        target: &str,
        mask: VmState,
    ) -> FleetResult<Vec<(String, FleetResult<Arc<dyn Vm>>)>> {
        let snapshot = self.snapshot();

        if target == WILDCARD {
            return Ok(snapshot
                .into_iter()
                .filter(|vm| vm.state().intersects(mask))
                .map(|vm| (vm.name().to_string(), Ok(vm)))
                .collect());
        }

        Ok(expand_list(target)?
            .into_iter()
            .map(|t| {
                let vm = lookup(&snapshot, &t);
                (t, vm)
            })
            .collect())
    }
}

/// Runs `op` on every VM the target resolves to, concurrently.
///
/// Returns exactly one outcome per resolved target, in resolution order.
pub async fn apply<T, F, Fut>(
    registry: &VmRegistry,
    target: &str,
    mask: VmState,
    op: F,
) -> FleetResult<Vec<TargetOutcome<T>>>
where
    F: Fn(Arc<dyn Vm>) -> Fut,
    Fut: Future<Output = FleetResult<T>>,
{
    let resolved = registry.resolve(target, mask)?;
    debug!("target {} resolved to {} vms", target, resolved.len());

    let pending = resolved.into_iter().map(|(target, vm)| {
        let fut = vm.map(&op);
        async move {
            let result = match fut {
                Ok(fut) => fut.await,
                Err(e) => Err(e),
            };
            TargetOutcome { target, result }
        }
    });

    Ok(join_all(pending).await)
}
