#![cfg_attr(target_os = "none", no_std)]
#![cfg_attr(target_os = "none", no_main)]
#![cfg_attr(target_os = "none", allow(static_mut_refs))]

#[cfg(target_os = "none")]
extern crate panic_halt;

#[cfg_attr(not(target_os = "none"), allow(dead_code))]
mod bridge;
#[cfg_attr(not(target_os = "none"), allow(dead_code))]
mod console;

#[cfg(target_os = "none")]
mod dap;
#[cfg(target_os = "none")]
mod hw;
#[cfg(target_os = "none")]
mod runtime;
#[cfg(target_os = "none")]
mod usb;

#[cfg(not(target_os = "none"))]
fn main() {}
