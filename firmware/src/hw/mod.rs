//! STM32F042 bindings for the `probe-core` pin and watchdog traits.
//!
//! Pin map (DAP42DC):
//!
//! | signal  | pin | mode |
//! |---------|-----|------|
//! | SWDIO   | PA0 | flex, push-pull when driving |
//! | SWCLK   | PA1 | flex, push-pull when driving |
//! | nRESET  | PA4 | open drain, released high |
//! | LED0..2 | PA5..PA7 | open drain, active low |
//! | SWDIR   | PB0 | push-pull (`swdio-direction` only) |
//! | CTL     | PB1 | push-pull, active low (`swdio-direction` only) |

pub mod boot;

use embassy_stm32::Peri;
use embassy_stm32::gpio::{Flex, Level, Output, OutputOpenDrain, Pull, Speed};
use embassy_stm32::peripherals::{IWDG, PA0, PA1, PA4, PA5, PA6, PA7};
use embassy_stm32::wdg::IndependentWatchdog;
use probe_core::indicator::StatusLeds;
use probe_core::pins::{FlexLine, InputLine, OutputLine, Polarity, ProbePins, SwdPins};
use probe_core::update::Watchdog;

#[cfg(feature = "swdio-direction")]
use embassy_stm32::peripherals::{PB0, PB1};
#[cfg(feature = "swdio-direction")]
use probe_core::pins::BufferedDirection;
#[cfg(not(feature = "swdio-direction"))]
use probe_core::pins::{DirectDirection, NoLine};

/// Bidirectional debug line.
pub struct FlexPin(Flex<'static>);

impl FlexPin {
    pub fn new(pin: Flex<'static>) -> Self {
        let mut line = Self(pin);
        line.set_as_input();
        line
    }
}

impl OutputLine for FlexPin {
    fn set_high(&mut self) {
        self.0.set_high();
    }

    fn set_low(&mut self) {
        self.0.set_low();
    }
}

impl InputLine for FlexPin {
    fn is_high(&self) -> bool {
        self.0.is_high()
    }
}

impl FlexLine for FlexPin {
    fn set_as_output(&mut self) {
        self.0.set_as_output(Speed::High);
    }

    fn set_as_input(&mut self) {
        self.0.set_as_input(Pull::None);
    }
}

pub struct PushPull(Output<'static>);

impl OutputLine for PushPull {
    fn set_high(&mut self) {
        self.0.set_high();
    }

    fn set_low(&mut self) {
        self.0.set_low();
    }
}

/// Open-drain output whose pad level can be read back.
pub struct OpenDrain(OutputOpenDrain<'static>);

impl OutputLine for OpenDrain {
    fn set_high(&mut self) {
        self.0.set_high();
    }

    fn set_low(&mut self) {
        self.0.set_low();
    }
}

impl InputLine for OpenDrain {
    fn is_high(&self) -> bool {
        self.0.is_high()
    }
}

#[cfg(not(feature = "swdio-direction"))]
pub type Direction = DirectDirection;
#[cfg(feature = "swdio-direction")]
pub type Direction = BufferedDirection<PushPull>;

#[cfg(not(feature = "swdio-direction"))]
pub type BootControl = NoLine;
#[cfg(feature = "swdio-direction")]
pub type BootControl = PushPull;

pub type BoardLeds = StatusLeds<OpenDrain, OpenDrain, OpenDrain>;
pub type BoardSwd = SwdPins<FlexPin, FlexPin, OpenDrain, Direction>;
pub type BoardPins = ProbePins<BoardSwd, BootControl, BoardLeds>;

pub struct PinResources {
    pub swdio: Peri<'static, PA0>,
    pub swclk: Peri<'static, PA1>,
    pub nreset: Peri<'static, PA4>,
    pub led0: Peri<'static, PA5>,
    pub led1: Peri<'static, PA6>,
    pub led2: Peri<'static, PA7>,
    #[cfg(feature = "swdio-direction")]
    pub swdir: Peri<'static, PB0>,
    #[cfg(feature = "swdio-direction")]
    pub ctl: Peri<'static, PB1>,
}

fn open_drain_released<P: embassy_stm32::gpio::Pin>(pin: Peri<'static, P>) -> OpenDrain {
    OpenDrain(OutputOpenDrain::new(pin, Level::High, Speed::Low))
}

/// Builds the board's pin set with every line released.
pub fn board_pins(resources: PinResources, led_polarity: Polarity) -> BoardPins {
    let leds = StatusLeds::new(
        open_drain_released(resources.led0),
        open_drain_released(resources.led1),
        open_drain_released(resources.led2),
        led_polarity,
    );

    let swclk = FlexPin::new(Flex::new(resources.swclk));
    let swdio = FlexPin::new(Flex::new(resources.swdio));
    let nreset = open_drain_released(resources.nreset);

    #[cfg(not(feature = "swdio-direction"))]
    let (swd, boot_ctl) = (
        SwdPins::with_direction(swclk, swdio, nreset, DirectDirection),
        NoLine,
    );

    #[cfg(feature = "swdio-direction")]
    let (swd, boot_ctl) = {
        let swdir = PushPull(Output::new(resources.swdir, Level::Low, Speed::High));
        let ctl = PushPull(Output::new(resources.ctl, Level::High, Speed::Low));
        (
            SwdPins::with_direction(swclk, swdio, nreset, BufferedDirection::new(swdir)),
            ctl,
        )
    };

    ProbePins::new(swd, boot_ctl, leds)
}

/// Independent watchdog, started on construction.
pub struct IwdgWatchdog(IndependentWatchdog<'static, IWDG>);

impl IwdgWatchdog {
    pub fn start(iwdg: Peri<'static, IWDG>, period_ms: u32) -> Self {
        let mut watchdog = IndependentWatchdog::new(iwdg, period_ms * 1_000);
        watchdog.unleash();
        defmt::info!("watchdog: armed, period={=u32}ms", period_ms);
        Self(watchdog)
    }
}

impl Watchdog for IwdgWatchdog {
    fn refresh(&mut self) {
        self.0.pet();
    }
}
