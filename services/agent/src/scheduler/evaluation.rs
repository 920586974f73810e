//! Evaluations and their instruction plans.

use std::collections::BTreeMap;
use std::fmt;
use std::path::Path;
use std::sync::Arc;

use crate::allocation::{Allocation, Unit};

use super::instruction::{
    Instruction, Operation, PHASE_COMMAND, PHASE_DELETE, PHASE_DESTROY, PHASE_DISABLE,
    PHASE_ENABLE, PHASE_WRITE,
};

/// A pending transition of one pod from `left` to `right`.
///
/// `left` is `None` for a new pod, `right` is `None` for a removal.
#[derive(Debug, Clone)]
pub struct Evaluation {
    pub name: String,
    pub left: Option<Arc<Allocation>>,
    pub right: Option<Arc<Allocation>>,
}

impl Evaluation {
    pub fn new(
        name: impl Into<String>,
        left: Option<Arc<Allocation>>,
        right: Option<Arc<Allocation>>,
    ) -> Self {
        Self {
            name: name.into(),
            left,
            right,
        }
    }

    /// Instructions moving the node from `left` to `right`, ordered by phase.
    ///
    /// Units are matched by path. Removed units are stopped, disabled and
    /// deleted before anything new is written; new and changed units are
    /// written, enabled and then started (or updated). Unchanged units
    /// produce nothing.
    pub fn plan(&self) -> Vec<Instruction> {
        let current = units_by_path(self.left.as_deref());
        let desired = units_by_path(self.right.as_deref());
        let mut plan = Vec::new();

        for (path, unit) in &current {
            if desired.contains_key(path) {
                continue;
            }
            if let Some(command) = unit.header.destroy {
                plan.push(Instruction::new(
                    PHASE_DESTROY,
                    Operation::Command(command),
                    unit.file.clone(),
                ));
            }
            plan.push(Instruction::new(PHASE_DISABLE, Operation::Disable, unit.file.clone()));
            plan.push(Instruction::new(PHASE_DELETE, Operation::Delete, unit.file.clone()));
        }

        for (path, unit) in &desired {
            let command = match current.get(path) {
                None => unit.header.create,
                Some(old) if is_changed(old, unit) => unit.header.update,
                Some(_) => continue,
            };
            plan.push(Instruction::new(PHASE_WRITE, Operation::Write, unit.file.clone()));
            plan.push(Instruction::new(
                PHASE_ENABLE,
                Operation::Enable {
                    runtime: !unit.header.permanent,
                },
                unit.file.clone(),
            ));
            if let Some(command) = command {
                plan.push(Instruction::new(
                    PHASE_COMMAND,
                    Operation::Command(command),
                    unit.file.clone(),
                ));
            }
        }

        plan.sort_by_key(|instruction| instruction.phase);
        plan
    }
}

impl fmt::Display for Evaluation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mark = |alloc: &Option<Arc<Allocation>>| {
            alloc
                .as_ref()
                .map(|alloc| alloc.mark().to_string())
                .unwrap_or_else(|| "<none>".to_string())
        };
        write!(f, "{}: {} -> {}", self.name, mark(&self.left), mark(&self.right))
    }
}

fn units_by_path(allocation: Option<&Allocation>) -> BTreeMap<&Path, &Unit> {
    allocation
        .map(|allocation| {
            allocation
                .all_units()
                .map(|unit| (unit.file.path.as_path(), unit))
                .collect()
        })
        .unwrap_or_default()
}

fn is_changed(old: &Unit, new: &Unit) -> bool {
    old.file.source != new.file.source || old.header.permanent != new.header.permanent
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::allocation::SystemPaths;
    use tilth_manifest::{parse_pods, FlatMap, UnitCommand};

    fn alloc(src: &str) -> Arc<Allocation> {
        let pod = parse_pods("private", src).unwrap().remove(0);
        Arc::new(Allocation::from_manifest(&pod, &FlatMap::new(), &SystemPaths::default()).unwrap())
    }

    fn ops(plan: &[Instruction], unit: &str) -> Vec<(u8, Operation)> {
        plan.iter()
            .filter(|i| i.unit.name() == unit)
            .map(|i| (i.phase, i.operation))
            .collect()
    }

    const SERVICE: &str = r#"{"create": "start", "update": "restart", "destroy": "stop"}"#;

    #[test]
    fn test_plan_create() {
        let right = alloc(&format!(
            r#"[{{"name": "pod-1", "units": [{{"name": "a.service", "source": "a", "transition": {SERVICE}}}]}}]"#
        ));
        let plan = Evaluation::new("pod-1", None, Some(right)).plan();

        assert_eq!(
            ops(&plan, "a.service"),
            vec![
                (PHASE_WRITE, Operation::Write),
                (PHASE_ENABLE, Operation::Enable { runtime: true }),
                (PHASE_COMMAND, Operation::Command(UnitCommand::Start)),
            ]
        );
        assert_eq!(
            ops(&plan, "pod-private-pod-1.service").last(),
            Some(&(PHASE_COMMAND, Operation::Command(UnitCommand::Start)))
        );
        assert_eq!(plan.len(), 6);
    }

    #[test]
    fn test_plan_destroy() {
        let left = alloc(&format!(
            r#"[{{"name": "pod-1", "units": [{{"name": "a.service", "transition": {SERVICE}}}]}}]"#
        ));
        let plan = Evaluation::new("pod-1", Some(left), None).plan();

        assert_eq!(
            ops(&plan, "a.service"),
            vec![
                (PHASE_DESTROY, Operation::Command(UnitCommand::Stop)),
                (PHASE_DISABLE, Operation::Disable),
                (PHASE_DELETE, Operation::Delete),
            ]
        );
        assert!(plan.iter().all(|i| i.phase <= PHASE_DELETE));
    }

    #[test]
    fn test_plan_replace_unit() {
        let left = alloc(&format!(
            r#"[{{"name": "pod-1", "units": [
                {{"name": "u1.service", "transition": {SERVICE}}},
                {{"name": "same.service", "source": "same"}}]}}]"#
        ));
        let right = alloc(&format!(
            r#"[{{"name": "pod-1", "units": [
                {{"name": "u2.service", "transition": {SERVICE}}},
                {{"name": "same.service", "source": "same"}}]}}]"#
        ));
        let plan = Evaluation::new("pod-1", Some(left), Some(right)).plan();

        let removed_max = plan
            .iter()
            .filter(|i| i.unit.name() == "u1.service")
            .map(|i| i.phase)
            .max()
            .unwrap();
        let added_min = plan
            .iter()
            .filter(|i| i.unit.name() == "u2.service")
            .map(|i| i.phase)
            .min()
            .unwrap();
        assert!(removed_max < added_min);
        assert!(ops(&plan, "same.service").is_empty());

        // The pod unit changed with the unit list and is restarted.
        assert_eq!(
            ops(&plan, "pod-private-pod-1.service").last(),
            Some(&(PHASE_COMMAND, Operation::Command(UnitCommand::Restart)))
        );
        assert!(plan.windows(2).all(|w| w[0].phase <= w[1].phase));
    }

    #[test]
    fn test_plan_update_without_command() {
        let left = alloc(
            r#"[{"name": "pod-1", "units": [{"name": "a.service", "source": "v1", "permanent": true}]}]"#,
        );
        let right = alloc(
            r#"[{"name": "pod-1", "units": [{"name": "a.service", "source": "v2", "permanent": true}]}]"#,
        );
        let plan = Evaluation::new("pod-1", Some(left), Some(right)).plan();

        assert_eq!(
            ops(&plan, "a.service"),
            vec![
                (PHASE_WRITE, Operation::Write),
                (PHASE_ENABLE, Operation::Enable { runtime: false }),
            ]
        );
    }

    #[test]
    fn test_plan_noop() {
        let left = alloc(r#"[{"name": "pod-1", "units": [{"name": "a.service"}]}]"#);
        let plan = Evaluation::new("pod-1", Some(left.clone()), Some(left)).plan();
        assert!(plan.is_empty());
    }
}
