//! CMSIS-DAP v2 engine over the vendor bulk endpoints.

use core::task::Poll;

use embassy_futures::poll_once;
use embassy_usb::driver::{Endpoint, EndpointError, EndpointIn as _, EndpointOut as _};
use probe_core::dap::{DapInfo, DapProcessor, HeldReply, PACKET_SIZE, REPLY_TIMEOUT_TICKS};
use probe_core::indicator::StatusIndicators;
use probe_core::pins::DebugPort;
use probe_core::supervisor::{DebugEngine, EngineStatus};
use probe_core::tick::{TickCounter, TickSource};
use probe_core::update::BootloaderRequest;

use crate::usb::DapEndpoints;

const DAP_ERROR: u8 = 0xFF;

pub struct DapEngine {
    endpoints: DapEndpoints,
    processor: DapProcessor,
    request: [u8; PACKET_SIZE],
    response: [u8; PACKET_SIZE],
    reply: HeldReply,
    clock: &'static TickCounter,
}

impl DapEngine {
    pub fn new(endpoints: DapEndpoints, info: DapInfo, clock: &'static TickCounter) -> Self {
        Self {
            endpoints,
            processor: DapProcessor::new(info),
            request: [0; PACKET_SIZE],
            response: [0; PACKET_SIZE],
            reply: HeldReply::new(),
            clock,
        }
    }

    /// Offers the held reply to the IN endpoint; it stays held until taken.
    fn flush(&mut self) {
        let Some(len) = self.reply.pending_len() else {
            return;
        };
        if let Poll::Ready(result) = poll_once(self.endpoints.write.write(&self.response[..len])) {
            if let Err(err) = result {
                log_endpoint_error("write", err);
            }
            self.reply.release();
        }
    }
}

impl<P> DebugEngine<P> for DapEngine
where
    P: DebugPort + StatusIndicators + ?Sized,
{
    fn update(&mut self, port: &mut P, bootloader: &mut BootloaderRequest) -> EngineStatus {
        if self.reply.pending_len().is_some() {
            self.flush();
            if self.reply.expire(self.clock.now(), REPLY_TIMEOUT_TICKS) {
                defmt::warn!("dap: host did not collect reply, dropped");
                return EngineStatus::Idle;
            }
            return EngineStatus::Active;
        }

        if poll_once(self.endpoints.read.wait_enabled()).is_pending() {
            return EngineStatus::Idle;
        }

        let received = match poll_once(self.endpoints.read.read(&mut self.request)) {
            Poll::Pending => return EngineStatus::Idle,
            Poll::Ready(Ok(received)) => received,
            Poll::Ready(Err(err)) => {
                log_endpoint_error("read", err);
                return EngineStatus::Idle;
            }
        };

        let len = match self.processor.process(
            port,
            bootloader,
            &self.request[..received],
            &mut self.response,
        ) {
            Ok(len) => len,
            Err(err) => {
                defmt::warn!("dap: request rejected: {}", err);
                self.response[0] = DAP_ERROR;
                1
            }
        };

        self.reply.hold(len, self.clock.now());
        self.flush();
        EngineStatus::Active
    }
}

fn log_endpoint_error(direction: &str, err: EndpointError) {
    match err {
        EndpointError::Disabled => defmt::debug!("dap: {=str} on disabled endpoint", direction),
        EndpointError::BufferOverflow => {
            defmt::warn!("dap: {=str} buffer overflow", direction);
        }
    }
}
