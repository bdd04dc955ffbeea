//! Domain models for billing-engine.

mod directory;
mod formula;
mod generation_log;
mod interest;
mod payment;
mod period;
mod quota;
mod schedule;

pub use directory::{Currency, ExchangeRate, Unit};
pub use formula::{FormulaKind, QuotaFormula, QuotaFormulaRow};
pub use generation_log::{GenerationLog, GenerationMethod, GenerationStatus};
pub use interest::{
    AccrualFailure, AccrualScope, AccrualSummary, CalculationPeriod, InterestConfiguration,
    InterestType,
};
pub use payment::{
    AllocationResult, Payment, PaymentApplication, PaymentStatus, PendingAllocation,
    PendingAllocationStatus, Resolution, ResolutionType,
};
pub use period::{ParsePeriodError, Period, RecordState};
pub use quota::{AdjustmentType, Quota, QuotaAdjustment, QuotaStatus};
pub use schedule::{Frequency, GenerationRule, GenerationSchedule};
