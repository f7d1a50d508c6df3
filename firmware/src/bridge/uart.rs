use core::task::Poll;

use embassy_futures::poll_once;
use embassy_stm32::Peri;
use embassy_stm32::peripherals::{PA2, PA3, USART2};
use embassy_stm32::usart::{
    BufferedInterruptHandler, BufferedUart, Config as UartConfig, DataBits, Parity, StopBits,
};
use embassy_usb::driver::EndpointError;
use embedded_io::{Read, ReadReady};
use embedded_io_async::Write;
use probe_core::supervisor::{HostEvents, Subsystem};
use static_cell::StaticCell;

use super::{Backlog, LineMonitor, ParityMode, StopMode, UartFormat};
use crate::usb::{CdcAcmHandle, MAX_PACKET_SIZE};

const UART_BUFFER_SIZE: usize = 256;
const PACKET: usize = MAX_PACKET_SIZE as usize;

static UART_TX_BUFFER: StaticCell<[u8; UART_BUFFER_SIZE]> = StaticCell::new();
static UART_RX_BUFFER: StaticCell<[u8; UART_BUFFER_SIZE]> = StaticCell::new();

embassy_stm32::bind_interrupts!(struct UartIrqs {
    USART2 => BufferedInterruptHandler<USART2>;
});

pub struct UartResources {
    pub usart: Peri<'static, USART2>,
    pub tx: Peri<'static, PA2>,
    pub rx: Peri<'static, PA3>,
}

fn uart_config(format: UartFormat) -> UartConfig {
    let mut config = UartConfig::default();
    config.baudrate = format.baud;
    config.data_bits = if format.word_bits == 9 {
        DataBits::DataBits9
    } else {
        DataBits::DataBits8
    };
    config.parity = match format.parity {
        ParityMode::None => Parity::ParityNone,
        ParityMode::Odd => Parity::ParityOdd,
        ParityMode::Even => Parity::ParityEven,
    };
    config.stop_bits = match format.stop {
        StopMode::One => StopBits::STOP1,
        StopMode::OneAndHalf => StopBits::STOP1P5,
        StopMode::Two => StopBits::STOP2,
    };
    config
}

pub struct SerialBridge {
    uart: BufferedUart<'static>,
    usb: CdcAcmHandle,
    lines: LineMonitor,
    format: UartFormat,
    ingress: [u8; PACKET],
    /// Part of `ingress` the UART has not taken yet.
    backlog: Backlog,
    egress: [u8; PACKET],
    /// UART bytes read but not yet taken by the IN endpoint.
    pending: Option<usize>,
}

impl SerialBridge {
    pub fn new(resources: UartResources, usb: CdcAcmHandle, baud: u32) -> Self {
        let format = UartFormat::eight_n_one(baud);
        let uart = BufferedUart::new(
            resources.usart,
            resources.rx,
            resources.tx,
            UART_TX_BUFFER.init([0; UART_BUFFER_SIZE]),
            UART_RX_BUFFER.init([0; UART_BUFFER_SIZE]),
            UartIrqs,
            uart_config(format),
        )
        .expect("failed to initialize bridge UART");

        defmt::info!("bridge: USART2 at {=u32} baud", baud);

        Self {
            uart,
            usb,
            lines: LineMonitor::new(),
            format,
            ingress: [0; PACKET],
            backlog: Backlog::new(),
            egress: [0; PACKET],
            pending: None,
        }
    }

    fn apply_control<E: HostEvents + ?Sized>(&mut self, events: &mut E) {
        let sender = &self.usb.sender;
        if let Some((dtr, rts)) = self.lines.update(sender.dtr(), sender.rts()) {
            defmt::debug!("bridge: DTR={=bool} RTS={=bool}", dtr, rts);
            events.on_control_line_change(dtr, rts);
        }

        let coding = sender.line_coding();
        let Some(format) = UartFormat::from_line_coding(
            coding.data_rate(),
            coding.data_bits(),
            coding.parity_type() as u8,
            coding.stop_bits() as u8,
        ) else {
            defmt::warn!("bridge: unsupported line coding ignored");
            return;
        };
        if format == self.format {
            return;
        }
        match self.uart.set_config(&uart_config(format)) {
            Ok(()) => {
                self.format = format;
                defmt::info!(
                    "bridge: line coding {=u32} baud, {=u8}-bit word",
                    format.baud,
                    format.word_bits
                );
            }
            Err(_) => defmt::warn!("bridge: failed to apply line coding"),
        }
    }

    fn usb_to_uart<E: HostEvents + ?Sized>(&mut self, events: &mut E) {
        if self.backlog.is_empty() {
            match poll_once(self.usb.receiver.read_packet(&mut self.ingress)) {
                Poll::Ready(Ok(0)) | Poll::Pending => return,
                Poll::Ready(Ok(count)) => {
                    events.on_activity();
                    self.backlog.fill(count);
                }
                Poll::Ready(Err(EndpointError::BufferOverflow)) => {
                    defmt::warn!("bridge: USB packet overflow");
                    return;
                }
                Poll::Ready(Err(EndpointError::Disabled)) => return,
            }
        }

        // The TX ring takes what fits; the rest waits for a later iteration.
        let range = self.backlog.remaining();
        match poll_once(self.uart.write(&self.ingress[range])) {
            Poll::Ready(Ok(count)) => {
                self.backlog.advance(count);
            }
            Poll::Ready(Err(_)) => {
                defmt::warn!("bridge: UART write error");
                self.backlog.clear();
            }
            Poll::Pending => {}
        }
    }

    fn uart_to_usb<E: HostEvents + ?Sized>(&mut self, events: &mut E) {
        if self.pending.is_none() {
            match self.uart.read_ready() {
                Ok(true) => match self.uart.read(&mut self.egress) {
                    Ok(0) => return,
                    Ok(count) => {
                        events.on_activity();
                        self.pending = Some(count);
                    }
                    Err(_) => {
                        defmt::warn!("bridge: UART read error");
                        return;
                    }
                },
                Ok(false) => return,
                Err(_) => {
                    defmt::warn!("bridge: UART read error");
                    return;
                }
            }
        }

        let Some(len) = self.pending else {
            return;
        };
        if let Poll::Ready(result) = poll_once(self.usb.sender.write_packet(&self.egress[..len])) {
            if let Err(EndpointError::BufferOverflow) = result {
                defmt::warn!("bridge: USB write overflow");
            }
            // Bytes are dropped while the port is closed.
            self.pending = None;
        }
    }
}

impl Subsystem for SerialBridge {
    fn update<E: HostEvents + ?Sized>(&mut self, events: &mut E) {
        if poll_once(self.usb.control.control_changed()).is_ready() {
            self.apply_control(events);
        }
        self.usb_to_uart(events);
        self.uart_to_usb(events);
    }
}
