//! Dispersal coordination
//!
//! 1. The planner prices a verified deposit and splits it into per-chain legs
//! 2. The distributor checks treasury liquidity and pays each leg out
//! 3. The lifecycle manager records every leg's progress on the intent

pub mod distributor;
pub mod lifecycle;
pub mod planner;

pub use distributor::{
    ChainStats, CoordinatorMetrics, DistributionCoordinator, DistributionOutcome,
    DistributionRequest, DistributionResult, LiquidityReport, TokenBalance, TreasuryBalance,
};
pub use lifecycle::IntentLifecycleManager;
pub use planner::{DistributionPlan, DistributionPlanner};
