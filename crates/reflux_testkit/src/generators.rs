//! Property-based test generators using proptest.
//!
//! Provides strategies for generating write plans: sequences of field
//! assignments over a fixed set of handles and fields.

use proptest::prelude::*;
use reflux_core::{CoreResult, FieldName, Handle};
use std::collections::BTreeMap;

/// Field names used by generated plans.
pub const FIELDS: [FieldName; 8] = ["a", "b", "c", "d", "e", "f", "g", "h"];

/// Number of handles addressed by generated plans.
pub const HANDLE_COUNT: usize = 3;

/// A single field assignment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WriteOp {
    /// Index of the target handle.
    pub handle: usize,
    /// Index into [`FIELDS`].
    pub field: usize,
    /// Assigned value.
    pub value: i64,
}

impl WriteOp {
    /// Returns the field name.
    pub fn field_name(&self) -> FieldName {
        FIELDS[self.field]
    }
}

/// Strategy for generating a single assignment.
pub fn write_op_strategy() -> impl Strategy<Value = WriteOp> {
    (0..HANDLE_COUNT, 0..FIELDS.len(), any::<i64>()).prop_map(|(handle, field, value)| WriteOp {
        handle,
        field,
        value,
    })
}

/// Strategy for generating a sequence of assignments.
pub fn write_plan_strategy(min_ops: usize, max_ops: usize) -> impl Strategy<Value = Vec<WriteOp>> {
    prop::collection::vec(write_op_strategy(), min_ops..max_ops)
}

/// Strategy for generating two plans that touch disjoint fields.
///
/// A random mask splits the field set; assignments to fields in the mask go
/// to the first plan, the rest to the second.
pub fn disjoint_plans_strategy(max_ops: usize) -> impl Strategy<Value = (Vec<WriteOp>, Vec<WriteOp>)> {
    (write_plan_strategy(1, max_ops), any::<u8>()).prop_map(|(plan, mask)| {
        let (first, second): (Vec<WriteOp>, Vec<WriteOp>) =
            plan.into_iter().partition(|op| mask & (1 << op.field) != 0);
        (first, second)
    })
}

/// Applies a plan in the current transaction.
pub fn apply_plan(handles: &[Handle], plan: &[WriteOp]) -> CoreResult<()> {
    for op in plan {
        handles[op.handle].set(op.field_name(), op.value)?;
    }
    Ok(())
}

/// Returns the final value of every (handle, field) a plan assigns.
pub fn expected_state(plans: &[&[WriteOp]]) -> BTreeMap<(usize, usize), i64> {
    let mut state = BTreeMap::new();
    for plan in plans {
        for op in plan.iter() {
            state.insert((op.handle, op.field), op.value);
        }
    }
    state
}

/// Configuration for property tests.
#[derive(Debug, Clone)]
pub struct PropTestConfig {
    /// Number of test cases to run.
    pub cases: u32,
    /// Maximum shrink iterations.
    pub max_shrink_iters: u32,
}

impl Default for PropTestConfig {
    fn default() -> Self {
        Self {
            cases: 256,
            max_shrink_iters: 1000,
        }
    }
}

impl PropTestConfig {
    /// Creates a configuration for quick tests.
    #[must_use]
    pub fn quick() -> Self {
        Self {
            cases: 32,
            max_shrink_iters: 100,
        }
    }

    /// Creates a configuration for thorough tests.
    #[must_use]
    pub fn thorough() -> Self {
        Self {
            cases: 1024,
            max_shrink_iters: 10000,
        }
    }

    /// Converts to proptest config.
    #[must_use]
    pub fn to_proptest_config(&self) -> ProptestConfig {
        ProptestConfig {
            cases: self.cases,
            max_shrink_iters: self.max_shrink_iters,
            ..ProptestConfig::default()
        }
    }
}
