//! Fatal diagnostics.
//!
//! Contract violations and ownership cycles are programming errors. They are
//! never returned to the caller: the global lock is released, the diagnostic
//! is emitted as a `tracing` error event and written to stderr together with
//! a backtrace, and the process aborts.
//!
//! A domain prints at most one report. A second fatal condition raised while
//! the first is being printed writes [`REENTRANT_REPORT`] and aborts
//! immediately.

use crate::error::ContractViolation;
use crate::runtime::Domain;
use crate::runtime::domain::CriticalSection;
use crate::sync::DeadlockReport;
use crate::types::FibrilId;
use std::backtrace::Backtrace;
use tracing::error;

/// Written when a fatal report is raised while another one is printing.
pub const REENTRANT_REPORT: &str = "Deadlock detected while printing deadlock. Aborting.";

fn claim_printer(domain: &Domain) {
    if !domain.begin_fatal_report() {
        eprintln!("{REENTRANT_REPORT}");
        std::process::abort();
    }
}

/// Reports an ownership cycle and aborts.
pub(crate) fn deadlock(domain: &Domain, report: &DeadlockReport) -> ! {
    claim_printer(domain);
    error!(
        fibril = %report.fibril,
        waits_for = %report.waits_for,
        chain = %report.to_json(),
        "deadlock detected"
    );
    eprintln!("{report}");
    eprintln!("{}", Backtrace::force_capture());
    std::process::abort()
}

/// Reports a broken usage contract and aborts.
///
/// Takes the critical section so the lock is released before printing.
pub(crate) fn violation(
    cs: CriticalSection<'_>,
    domain: &Domain,
    caller: FibrilId,
    violation: ContractViolation,
) -> ! {
    let caller_name = cs.fibril_name(caller);
    drop(cs);
    claim_printer(domain);
    error!(fibril = %caller, name = %caller_name, %violation, "contract violation");
    eprintln!("Contract violation in fibril {caller} ({caller_name}): {violation}");
    eprintln!("{}", Backtrace::force_capture());
    std::process::abort()
}

/// Reports a broken usage contract raised outside any fibril and aborts.
pub(crate) fn detached_violation(domain: &Domain, violation: ContractViolation) -> ! {
    claim_printer(domain);
    error!(%violation, "contract violation");
    eprintln!("Contract violation: {violation}");
    eprintln!("{}", Backtrace::force_capture());
    std::process::abort()
}
