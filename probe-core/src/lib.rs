#![no_std]

// Supervisory control layer for the DAP42 debug probe.
//
// Everything here is hardware agnostic: the firmware crate binds the traits to
// STM32 peripherals and the emulator binds them to simulated lines, so the same
// superloop, target-state machine and pin contract run on both.

pub mod activity;
pub mod config;
pub mod dap;
pub mod indicator;
pub mod pins;
pub mod slcan;
pub mod supervisor;
pub mod target;
pub mod tick;
pub mod update;
