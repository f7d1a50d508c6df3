use core::future::Future;
use core::marker::PhantomData;
use core::mem::MaybeUninit;
use core::pin::pin;

use cortex_m::interrupt;
use cortex_m::peripheral::syst::SystClkSource;
use cortex_m::register::primask;
use critical_section::{self, RawRestoreState};
use defmt_rtt as _;
use embassy_stm32 as hal;
use embassy_stm32::rcc::{Hsi48Config, Sysclk, mux};
use probe_core::config::ProbeConfig;
use probe_core::dap::DapInfo;
use probe_core::pins::Polarity;
use probe_core::supervisor::{Absent, Board, Peripherals, Supervisor};
use probe_core::tick::{TICK_HZ, TickCounter};
use probe_core::update::boot_gate;

use crate::dap::DapEngine;
use crate::hw::{self, BoardPins, IwdgWatchdog, PinResources};
use crate::usb::{self, UsbDeviceStrings, UsbPoller};

#[cfg(feature = "serial-bridge")]
use crate::bridge::{SerialBridge, UartResources};
#[cfg(feature = "virtual-serial")]
use crate::console::VirtualSerial;
#[cfg(feature = "update-mode")]
use crate::hw::boot::SystemBootloader;
#[cfg(not(feature = "update-mode"))]
use probe_core::update::NoUpdateMode;

const SYSCLK_HZ: u32 = 48_000_000;
/// Hold time of each LED self-test pattern, in core cycles.
const SELF_TEST_STEP_CYCLES: u32 = SYSCLK_HZ / 20;

critical_section::set_impl!(InterruptCriticalSection);

struct InterruptCriticalSection;

unsafe impl critical_section::Impl for InterruptCriticalSection {
    unsafe fn acquire() -> RawRestoreState {
        let primask = primask::read();
        interrupt::disable();
        primask.is_active()
    }

    unsafe fn release(restore_state: RawRestoreState) {
        if restore_state {
            unsafe {
                interrupt::enable();
            }
        }
    }
}

embassy_stm32::bind_interrupts!(struct UsbIrqs {
    USB => embassy_stm32::usb::InterruptHandler<hal::peripherals::USB>;
});

static TICKS: TickCounter = TickCounter::new();
static mut USB_STORAGE: MaybeUninit<usb::UsbDeviceStorage> = MaybeUninit::uninit();

#[cortex_m_rt::exception]
fn SysTick() {
    TICKS.tick();
}

#[cfg(feature = "serial-bridge")]
type SerialBridgeSlot = SerialBridge;
#[cfg(not(feature = "serial-bridge"))]
type SerialBridgeSlot = Absent;

#[cfg(feature = "virtual-serial")]
type VirtualSerialSlot = VirtualSerial;
#[cfg(not(feature = "virtual-serial"))]
type VirtualSerialSlot = Absent;

#[cfg(feature = "update-mode")]
type Update = SystemBootloader;
#[cfg(not(feature = "update-mode"))]
type Update = NoUpdateMode;

/// Concrete subsystem set; `F` is the pinned USB device future.
struct FirmwareBoard<'a, F>(PhantomData<&'a mut F>);

impl<'a, F: Future> Board for FirmwareBoard<'a, F> {
    type Pins = BoardPins;
    type Clock = &'static TickCounter;
    type Watchdog = IwdgWatchdog;
    type Usb = UsbPoller<'a, F>;
    type SerialBridge = SerialBridgeSlot;
    type CanBridge = Absent;
    type VirtualSerial = VirtualSerialSlot;
    type Engine = DapEngine;
    type Update = Update;
}

fn hal_config() -> hal::Config {
    let mut config = hal::Config::default();
    config.rcc.hsi48 = Some(Hsi48Config {
        sync_from_usb: true,
    });
    config.rcc.sys = Sysclk::HSI48;
    config.rcc.mux.usbsel = mux::Usbsel::HSI48;
    config
}

fn start_tick(mut syst: cortex_m::peripheral::SYST) {
    syst.set_clock_source(SystClkSource::Core);
    syst.set_reload(SYSCLK_HZ / TICK_HZ - 1);
    syst.clear_current();
    syst.enable_counter();
    syst.enable_interrupt();
}

#[cortex_m_rt::entry]
fn main() -> ! {
    let config = ProbeConfig::DEFAULT
        .with_led_polarity(Polarity::ActiveLow)
        .with_update_mode(cfg!(feature = "update-mode"));

    let mut update = Update::default();
    boot_gate(&config, &mut update);

    let core = cortex_m::Peripherals::take().expect("core peripherals already taken");
    let p = hal::init(hal_config());
    start_tick(core.SYST);
    defmt::info!("runtime: clocks up, tick at {=u32} Hz", TICK_HZ);

    let pins = hw::board_pins(
        PinResources {
            swdio: p.PA0,
            swclk: p.PA1,
            nreset: p.PA4,
            led0: p.PA5,
            led1: p.PA6,
            led2: p.PA7,
            #[cfg(feature = "swdio-direction")]
            swdir: p.PB0,
            #[cfg(feature = "swdio-direction")]
            ctl: p.PB1,
        },
        config.led_polarity,
    );

    // SAFETY: written once here, before anything else can observe it.
    let storage = unsafe { USB_STORAGE.write(usb::UsbDeviceStorage::new()) };
    let driver = embassy_stm32::usb::Driver::new(p.USB, UsbIrqs, p.PA12, p.PA11);
    let mut composite = usb::UsbComposite::new(driver, storage, UsbDeviceStrings::default());

    let engine = DapEngine::new(
        composite.take_dap().expect("DAP interface unavailable"),
        DapInfo::DEFAULT,
        &TICKS,
    );

    #[cfg(feature = "serial-bridge")]
    let serial_bridge = SerialBridge::new(
        UartResources {
            usart: p.USART2,
            tx: p.PA2,
            rx: p.PA3,
        },
        composite
            .take_bridge()
            .expect("bridge CDC interface unavailable"),
        config.uart_baud,
    );
    #[cfg(not(feature = "serial-bridge"))]
    let serial_bridge = Absent;

    #[cfg(feature = "virtual-serial")]
    let virtual_serial = VirtualSerial::new(
        composite
            .take_console()
            .expect("console CDC interface unavailable"),
        &TICKS,
    );
    #[cfg(not(feature = "virtual-serial"))]
    let virtual_serial = Absent;

    let mut device = composite.device;
    let device_run = pin!(device.run());

    let watchdog = IwdgWatchdog::start(p.IWDG, config.watchdog_period_ms);

    let mut supervisor = Supervisor::new(
        config,
        Peripherals::<FirmwareBoard<'_, _>> {
            pins,
            clock: &TICKS,
            watchdog,
            usb: UsbPoller::new(device_run),
            serial_bridge,
            can_bridge: Absent,
            virtual_serial,
            engine,
            update,
        },
    );

    supervisor.power_on(|| cortex_m::asm::delay(SELF_TEST_STEP_CYCLES));
    defmt::info!("runtime: entering superloop");
    supervisor.run()
}
