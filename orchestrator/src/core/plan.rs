//! Execution plan: the order in which a workflow's steps are visited.
//!
//! Steps are grouped into units. A unit is either a single step or a parallel
//! group whose members run concurrently. The compensating `rollback` step is
//! never part of the plan.

use std::collections::HashMap;

use crate::core::workflow::{ROLLBACK_STEP_ID, Workflow};

/// A schedulable unit of steps, by index into `Workflow::steps`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Unit {
    Single(usize),
    /// Members in declaration order.
    Group(Vec<usize>),
}

impl Unit {
    pub fn steps(&self) -> &[usize] {
        match self {
            Unit::Single(idx) => std::slice::from_ref(idx),
            Unit::Group(members) => members,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutionPlan {
    pub units: Vec<Unit>,
    unit_of_step: HashMap<String, usize>,
}

impl ExecutionPlan {
    /// Build the plan for a validated workflow.
    ///
    /// An explicit group is placed at the position of its first declared
    /// member. Consecutive steps flagged `parallel` that belong to no explicit
    /// group form an implicit group.
    pub fn build(workflow: &Workflow) -> Self {
        let mut group_of: HashMap<&str, usize> = HashMap::new();
        for (group_no, group) in workflow.parallel.iter().enumerate() {
            for member in group {
                group_of.entry(member.as_str()).or_insert(group_no);
            }
        }

        let mut units = Vec::new();
        let mut emitted_groups = vec![false; workflow.parallel.len()];
        let mut idx = 0;
        while idx < workflow.steps.len() {
            let step = &workflow.steps[idx];
            if step.id == ROLLBACK_STEP_ID {
                idx += 1;
                continue;
            }
            if let Some(&group_no) = group_of.get(step.id.as_str()) {
                if !emitted_groups[group_no] {
                    emitted_groups[group_no] = true;
                    let members: Vec<usize> = workflow
                        .steps
                        .iter()
                        .enumerate()
                        .filter(|(_, s)| group_of.get(s.id.as_str()) == Some(&group_no))
                        .filter(|(_, s)| s.id != ROLLBACK_STEP_ID)
                        .map(|(i, _)| i)
                        .collect();
                    units.push(unit_from(members));
                }
                idx += 1;
                continue;
            }
            if step.is_parallel() {
                let start = idx;
                while idx < workflow.steps.len() {
                    let next = &workflow.steps[idx];
                    if !next.is_parallel()
                        || next.id == ROLLBACK_STEP_ID
                        || group_of.contains_key(next.id.as_str())
                    {
                        break;
                    }
                    idx += 1;
                }
                units.push(unit_from((start..idx).collect()));
                continue;
            }
            units.push(Unit::Single(idx));
            idx += 1;
        }

        let mut unit_of_step = HashMap::new();
        for (unit_no, unit) in units.iter().enumerate() {
            for &step_idx in unit.steps() {
                unit_of_step.insert(workflow.steps[step_idx].id.clone(), unit_no);
            }
        }
        Self {
            units,
            unit_of_step,
        }
    }

    /// Index of the unit that contains `step_id`.
    pub fn unit_index(&self, step_id: &str) -> Option<usize> {
        self.unit_of_step.get(step_id).copied()
    }
}

fn unit_from(mut members: Vec<usize>) -> Unit {
    if members.len() == 1 {
        return Unit::Single(members.remove(0));
    }
    Unit::Group(members)
}
