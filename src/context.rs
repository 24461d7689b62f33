//! The per-analysis context.
//!
//! All state that outlives a single abstract value lives here: the variable
//! interner, the options, and the program metadata. A context is owned by
//! one thread; independent analyses on the same thread must call
//! [`AnalysisContext::reset`] (done by [`crate::verifier::analyze`]) so that
//! variable identities and loop counters do not leak between runs.

use crate::platform::ProgramInfo;
use crate::variable::VariableFactory;

/// Knobs of the analysis.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VerifierOptions {
    /// Insert loop counters and check that every loop is bounded.
    pub check_termination: bool,
    /// Bound checked on every loop counter.
    pub max_loop_count: i64,
    /// Division by zero is defined (yields zero) and is not reported.
    pub allow_division_by_zero: bool,
    /// Refine the running state with every precondition, proven or not.
    pub assume_assertions: bool,
    /// Byte order used for memory reconstruction and byte swaps.
    pub big_endian: bool,
    /// Join iterations at a loop head before widening kicks in.
    pub widening_delay: usize,
    /// Bound on the descending iterations after a loop stabilizes.
    pub descending_iterations: usize,
    /// Report unusual but legal patterns.
    pub strict: bool,
}

impl Default for VerifierOptions {
    fn default() -> Self {
        VerifierOptions {
            check_termination: false,
            max_loop_count: 100_000,
            allow_division_by_zero: true,
            assume_assertions: false,
            big_endian: false,
            widening_delay: 1,
            descending_iterations: 1,
            strict: false,
        }
    }
}

#[derive(Debug)]
pub struct AnalysisContext {
    vars: VariableFactory,
    pub options: VerifierOptions,
    pub program_info: ProgramInfo,
}

impl AnalysisContext {
    pub fn new(program_info: ProgramInfo, options: VerifierOptions) -> Self {
        AnalysisContext {
            vars: VariableFactory::new(),
            options,
            program_info,
        }
    }

    pub fn vars(&self) -> &VariableFactory {
        &self.vars
    }

    /// Forgets all dynamically created variables.
    pub fn reset(&self) {
        log::trace!("Resetting analysis context ({} variables)", self.vars.len());
        self.vars.reset();
    }
}

impl Default for AnalysisContext {
    fn default() -> Self {
        AnalysisContext::new(ProgramInfo::default(), VerifierOptions::default())
    }
}
