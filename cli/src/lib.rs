//! lngate CLI - replay recorded daemon streams through the interception core.

pub mod commands;
pub mod input;
pub mod output;
