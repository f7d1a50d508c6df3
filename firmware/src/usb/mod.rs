//! USB composite device.
//!
//! Interfaces, in descriptor order:
//!
//! - CMSIS-DAP v2 vendor interface (bulk OUT/IN), always present
//! - CDC ACM bridge to USART2 (`serial-bridge`)
//! - CDC ACM virtual console (`virtual-serial`)
//! - DFU runtime interface (`update-mode`)
//!
//! The device future is polled once per superloop iteration through
//! [`UsbPoller`]; class handlers only raise flags that the poller turns into
//! [`HostEvents`] callbacks.

use core::future::Future;
use core::pin::Pin;

use embassy_futures::poll_once;
use embassy_stm32::peripherals::USB;
use embassy_usb::class::cdc_acm::{self, CdcAcmClass};
use embassy_usb::control::{InResponse, OutResponse, Recipient, Request, RequestType};
use embassy_usb::msos::{self, windows_version};
use embassy_usb::types::{InterfaceNumber, StringIndex};
use embassy_usb::{Builder, Handler};
use portable_atomic::{AtomicBool, Ordering};
use probe_core::dap::WIRE_PACKET_SIZE;
use probe_core::supervisor::{HostEvents, UsbTransport};

pub type UsbDriver = embassy_stm32::usb::Driver<'static, USB>;
pub type EndpointIn = <UsbDriver as embassy_usb::driver::Driver<'static>>::EndpointIn;
pub type EndpointOut = <UsbDriver as embassy_usb::driver::Driver<'static>>::EndpointOut;

pub const MAX_PACKET_SIZE: u16 = 64;

const CONTROL_BUFFER_LEN: usize = 64;
const CONFIG_DESCRIPTOR_LEN: usize = 256;
const BOS_DESCRIPTOR_LEN: usize = 256;
const MSOS_DESCRIPTOR_LEN: usize = 256;

/// Interface GUID CMSIS-DAP v2 hosts look for on Windows.
const DAP_INTERFACE_GUIDS: &[&str] = &["{CDB3B5AD-293B-4663-AA36-1AAE46463776}"];

const DFU_DETACH: u8 = 0x00;
const DFU_GETSTATUS: u8 = 0x03;
const DFU_GETSTATE: u8 = 0x05;
const DFU_APP_IDLE: u8 = 0x00;
/// bmAttributes: will detach, can download.
const DFU_ATTRIBUTES: u8 = 0x09;
const DFU_DETACH_TIMEOUT_MS: u16 = 255;
const DFU_TRANSFER_SIZE: u16 = 1024;
const DFU_VERSION: u16 = 0x011A;

/// Raised by the DFU runtime handler, consumed by [`UsbPoller`].
static DETACH_REQUESTED: AtomicBool = AtomicBool::new(false);

#[derive(Clone, Copy, Debug)]
pub struct UsbDeviceStrings {
    pub manufacturer: &'static str,
    pub product: &'static str,
    pub serial_number: Option<&'static str>,
    /// Must contain "CMSIS-DAP" for hosts to recognise the probe.
    pub dap_interface: &'static str,
}

impl Default for UsbDeviceStrings {
    fn default() -> Self {
        Self {
            manufacturer: "Devan Lai",
            product: "DAP42 CMSIS-DAP",
            serial_number: None,
            dap_interface: "DAP42 CMSIS-DAP",
        }
    }
}

/// Answers the string request for the DAP interface name.
struct DapStrings {
    index: Option<StringIndex>,
    name: &'static str,
}

impl Handler for DapStrings {
    fn get_string(&mut self, index: StringIndex, _lang_id: u16) -> Option<&str> {
        (Some(index) == self.index).then_some(self.name)
    }
}

/// DFU runtime: reports appIDLE and turns DFU_DETACH into an update request.
struct DfuRuntime {
    interface: Option<InterfaceNumber>,
}

impl DfuRuntime {
    fn addressed_to_us(&self, req: &Request) -> bool {
        req.request_type == RequestType::Class
            && req.recipient == Recipient::Interface
            && self.interface.is_some_and(|iface| u16::from(iface.0) == req.index)
    }
}

impl Handler for DfuRuntime {
    fn control_out(&mut self, req: Request, _data: &[u8]) -> Option<OutResponse> {
        if !self.addressed_to_us(&req) {
            return None;
        }
        match req.request {
            DFU_DETACH => {
                DETACH_REQUESTED.store(true, Ordering::Release);
                Some(OutResponse::Accepted)
            }
            _ => Some(OutResponse::Rejected),
        }
    }

    fn control_in<'a>(&'a mut self, req: Request, buf: &'a mut [u8]) -> Option<InResponse<'a>> {
        if !self.addressed_to_us(&req) {
            return None;
        }
        match req.request {
            DFU_GETSTATUS if buf.len() >= 6 => {
                // bStatus OK, bwPollTimeout 0, bState, iString 0.
                buf[..6].copy_from_slice(&[0, 0, 0, 0, DFU_APP_IDLE, 0]);
                Some(InResponse::Accepted(&buf[..6]))
            }
            DFU_GETSTATE if !buf.is_empty() => {
                buf[0] = DFU_APP_IDLE;
                Some(InResponse::Accepted(&buf[..1]))
            }
            _ => Some(InResponse::Rejected),
        }
    }
}

/// Backing storage for the builder, class state and handlers.
pub struct UsbDeviceStorage {
    control_buf: [u8; CONTROL_BUFFER_LEN],
    config_descriptor: [u8; CONFIG_DESCRIPTOR_LEN],
    bos_descriptor: [u8; BOS_DESCRIPTOR_LEN],
    msos_descriptor: [u8; MSOS_DESCRIPTOR_LEN],
    bridge_state: cdc_acm::State<'static>,
    console_state: cdc_acm::State<'static>,
    dap_strings: DapStrings,
    dfu: DfuRuntime,
}

impl UsbDeviceStorage {
    pub fn new() -> Self {
        Self {
            control_buf: [0; CONTROL_BUFFER_LEN],
            config_descriptor: [0; CONFIG_DESCRIPTOR_LEN],
            bos_descriptor: [0; BOS_DESCRIPTOR_LEN],
            msos_descriptor: [0; MSOS_DESCRIPTOR_LEN],
            bridge_state: cdc_acm::State::new(),
            console_state: cdc_acm::State::new(),
            dap_strings: DapStrings {
                index: None,
                name: "",
            },
            dfu: DfuRuntime { interface: None },
        }
    }
}

/// Bulk endpoint pair of the CMSIS-DAP interface.
pub struct DapEndpoints {
    pub read: EndpointOut,
    pub write: EndpointIn,
}

/// Split handles for a CDC ACM interface.
pub struct CdcAcmHandle {
    pub sender: cdc_acm::Sender<'static, UsbDriver>,
    pub receiver: cdc_acm::Receiver<'static, UsbDriver>,
    pub control: cdc_acm::ControlChanged<'static>,
}

fn cdc_handle(
    builder: &mut Builder<'static, UsbDriver>,
    state: &'static mut cdc_acm::State<'static>,
) -> CdcAcmHandle {
    let class = CdcAcmClass::new(builder, state, MAX_PACKET_SIZE);
    let (sender, receiver, control) = class.split_with_control();
    CdcAcmHandle {
        sender,
        receiver,
        control,
    }
}

pub struct UsbComposite {
    pub device: embassy_usb::UsbDevice<'static, UsbDriver>,
    dap: Option<DapEndpoints>,
    bridge: Option<CdcAcmHandle>,
    console: Option<CdcAcmHandle>,
}

impl UsbComposite {
    pub fn new(
        driver: UsbDriver,
        storage: &'static mut UsbDeviceStorage,
        strings: UsbDeviceStrings,
    ) -> Self {
        let mut config = embassy_usb::Config::new(0x1209, 0xDA42);
        config.manufacturer = Some(strings.manufacturer);
        config.product = Some(strings.product);
        config.serial_number = strings.serial_number;
        config.max_packet_size_0 = 64;
        config.max_power = 100;
        config.device_class = 0xEF;
        config.device_sub_class = 0x02;
        config.device_protocol = 0x01;
        config.composite_with_iads = true;

        let UsbDeviceStorage {
            control_buf,
            config_descriptor,
            bos_descriptor,
            msos_descriptor,
            bridge_state,
            console_state,
            dap_strings,
            dfu,
        } = storage;

        let mut builder = Builder::new(
            driver,
            config,
            config_descriptor,
            bos_descriptor,
            msos_descriptor,
            control_buf,
        );
        builder.msos_descriptor(windows_version::WIN8_1, 0);

        let dap_name = builder.string();
        dap_strings.index = Some(dap_name);
        dap_strings.name = strings.dap_interface;

        let dap = {
            let mut function = builder.function(0xFF, 0, 0);
            function.msos_feature(msos::CompatibleIdFeatureDescriptor::new("WINUSB", ""));
            function.msos_feature(msos::RegistryPropertyFeatureDescriptor::new(
                "DeviceInterfaceGUIDs",
                msos::PropertyData::RegMultiSz(DAP_INTERFACE_GUIDS),
            ));
            let mut interface = function.interface();
            let mut alt = interface.alt_setting(0xFF, 0, 0, Some(dap_name));
            let read = alt.endpoint_bulk_out(None, WIRE_PACKET_SIZE);
            let write = alt.endpoint_bulk_in(None, WIRE_PACKET_SIZE);
            DapEndpoints { read, write }
        };

        let bridge =
            cfg!(feature = "serial-bridge").then(|| cdc_handle(&mut builder, bridge_state));
        let console =
            cfg!(feature = "virtual-serial").then(|| cdc_handle(&mut builder, console_state));

        if cfg!(feature = "update-mode") {
            {
                let mut function = builder.function(0xFE, 0x01, 0x01);
                let mut interface = function.interface();
                dfu.interface = Some(interface.interface_number());
                let mut alt = interface.alt_setting(0xFE, 0x01, 0x01, None);
                let [timeout_lo, timeout_hi] = DFU_DETACH_TIMEOUT_MS.to_le_bytes();
                let [size_lo, size_hi] = DFU_TRANSFER_SIZE.to_le_bytes();
                let [version_lo, version_hi] = DFU_VERSION.to_le_bytes();
                alt.descriptor(
                    0x21,
                    &[
                        DFU_ATTRIBUTES,
                        timeout_lo,
                        timeout_hi,
                        size_lo,
                        size_hi,
                        version_lo,
                        version_hi,
                    ],
                );
            }
            builder.handler(dfu);
        }

        builder.handler(dap_strings);

        Self {
            device: builder.build(),
            dap: Some(dap),
            bridge,
            console,
        }
    }

    pub fn take_dap(&mut self) -> Option<DapEndpoints> {
        self.dap.take()
    }

    pub fn take_bridge(&mut self) -> Option<CdcAcmHandle> {
        self.bridge.take()
    }

    pub fn take_console(&mut self) -> Option<CdcAcmHandle> {
        self.console.take()
    }
}

/// Drives the pinned device future one step per superloop iteration.
pub struct UsbPoller<'a, F> {
    device: Pin<&'a mut F>,
}

impl<'a, F: Future> UsbPoller<'a, F> {
    pub fn new(device: Pin<&'a mut F>) -> Self {
        Self { device }
    }
}

impl<F: Future> UsbTransport for UsbPoller<'_, F> {
    fn poll<E: HostEvents + ?Sized>(&mut self, events: &mut E) {
        // The device future never completes.
        let _ = poll_once(self.device.as_mut());

        if DETACH_REQUESTED.swap(false, Ordering::AcqRel) {
            defmt::info!("usb: DFU detach requested");
            events.on_bootloader_request();
        }
    }
}
