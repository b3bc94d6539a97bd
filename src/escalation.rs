use std::str::FromStr;

use serde::Deserialize;

use crate::{error::FatalAnomaly, os::trap::debug_break};

/// What happens after a fatal anomaly has been written to the log.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Escalation {
    /// Stop at a debugger breakpoint (`SIGTRAP`), so the offending call is on
    /// top of the stack. Without a debugger attached this kills the process.
    #[default]
    Trap,
    /// `std::process::abort()`
    Abort,
    /// Log and carry on. The offending deallocation does nothing.
    Continue,
}

impl Escalation {
    pub fn escalate(self, anomaly: &FatalAnomaly) {
        match self {
            Escalation::Trap => {
                log::error!("halting on {anomaly}");
                debug_break();
            }
            Escalation::Abort => {
                log::error!("aborting on {anomaly}");
                std::process::abort();
            }
            Escalation::Continue => {
                log::warn!("continuing past {anomaly}");
            }
        }
    }
}

impl FromStr for Escalation {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "trap" | "break" => Ok(Escalation::Trap),
            "abort" => Ok(Escalation::Abort),
            "continue" | "log" => Ok(Escalation::Continue),
            _ => Err(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        alloc::record::{AllocKind, AllocationRecord, ErrorClass},
        symbol::CallSite,
    };

    #[test]
    fn parses_names() {
        assert_eq!("trap".parse(), Ok(Escalation::Trap));
        assert_eq!(" Abort ".parse(), Ok(Escalation::Abort));
        assert_eq!("continue".parse(), Ok(Escalation::Continue));
        assert_eq!("explode".parse::<Escalation>(), Err(()));
    }

    #[test]
    fn continue_returns() {
        let mut record = AllocationRecord::new(0x1000, 8, AllocKind::Array, CallSite::unknown());
        record.classify(ErrorClass::KindMismatch);
        Escalation::Continue.escalate(&FatalAnomaly { record });
    }
}
