//! Metering Service - rolls fractional agent usage up into whole billable
//! units and reports them exactly once to the metering processor.

pub mod audit;
pub mod config;
pub mod eligibility;
pub mod error;
pub mod ledger;
pub mod middleware;
pub mod models;
pub mod reporter;
pub mod rollup;
pub mod services;
pub mod startup;
