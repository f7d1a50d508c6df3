//! Update-mode entry through the STM32F042 system-memory bootloader.
//!
//! A request survives the reset as a magic word in `.uninit` RAM. The boot gate
//! consumes it before any peripheral is touched, which is the state the ROM
//! bootloader expects.

use core::mem::MaybeUninit;
use core::ptr;

use cortex_m::peripheral::SCB;
use embassy_stm32::pac;
use embassy_stm32::pac::syscfg::vals::MemMode;
use probe_core::update::UpdateMode;

const UPDATE_MAGIC: u32 = 0xDF00_B007;

/// Vector table of the ROM bootloader.
const SYSTEM_MEMORY: *const u32 = 0x1FFF_C400 as *const u32;
/// SYSCFG_CFGR1.MEM_MODE value aliasing system memory at 0x0000_0000.
const MEM_MODE_SYSTEM_FLASH: u8 = 0b01;

#[unsafe(link_section = ".uninit.UPDATE_REQUEST")]
static mut UPDATE_REQUEST: MaybeUninit<u32> = MaybeUninit::uninit();

#[derive(Default)]
pub struct SystemBootloader;

impl SystemBootloader {
    fn request_word() -> *mut u32 {
        (&raw mut UPDATE_REQUEST).cast::<u32>()
    }
}

impl UpdateMode for SystemBootloader {
    fn take_persisted_request(&mut self) -> bool {
        let word = Self::request_word();
        // SAFETY: single-threaded, before interrupts are enabled; any bit pattern is a valid u32.
        unsafe {
            let requested = ptr::read_volatile(word) == UPDATE_MAGIC;
            ptr::write_volatile(word, 0);
            requested
        }
    }

    fn jump(&mut self) -> ! {
        // Cortex-M0 has no VTOR: the ROM's interrupts only reach its own
        // vector table once system memory is mapped at address zero.
        pac::RCC.apb2enr().modify(|w| w.set_syscfgen(true));
        pac::SYSCFG
            .cfgr1()
            .modify(|w| w.set_mem_mode(MemMode::from_bits(MEM_MODE_SYSTEM_FLASH)));
        // SAFETY: called from the boot gate with the core fresh out of reset.
        unsafe { cortex_m::asm::bootload(SYSTEM_MEMORY) }
    }

    fn reset_and_jump(&mut self) -> ! {
        defmt::info!("update: resetting into system bootloader");
        // SAFETY: the word lives in `.uninit` and nothing else references it.
        unsafe { ptr::write_volatile(Self::request_word(), UPDATE_MAGIC) };
        SCB::sys_reset()
    }
}
