#![no_std]
//! Wireless charging control service
//!
//! Negotiates with a wireless transmitter, drives the receive path through its charging
//! states, runs fast charge with a closed-loop output controller and manages the
//! transmit path when the device charges an accessory.
use embassy_futures::join::{join, join3};
use embassy_sync::blocking_mutex::raw::NoopRawMutex;
use embassy_sync::channel::Channel;
use embassy_sync::mutex::Mutex;
use embassy_sync::signal::Signal;
use embedded_services::mms::TopicError;
use embedded_services::power::wireless::{
    AdapterType, Error, FastChargeController, IcEvent, NormalCharger, RxController, TrxStatus,
};
use embedded_services::{debug, error, info, trace, warn};

pub mod config;
pub mod control;
pub mod curve;
pub mod negotiation;
pub mod protocol;
pub mod rx;
pub mod status;
pub mod topic;
pub mod trx;
pub mod verity;
pub mod voter;

#[cfg(test)]
mod test_util;

use config::Config;
use protocol::message::{TxErrorCode, EXT_VENDOR_INFO};
use protocol::{Command, Frame, Inbound, Link, Message, Response, Transport, Wait};
use status::{DebugSettings, DeviceStatus};
use topic::{
    DiagEvent, DiagSubscription, DiagTopic, FastExit, PeerEvent, WirelessSubscription, WirelessTopic, WlsItem,
    WlsItemId,
};
use trx::TrxState;
use verity::{VerityData, VerityVariant};
use voter::{NormalStep, Votables, Vote, Voter};

/// Depth of the IC event queue
pub const IC_EVENT_DEPTH: usize = 8;

/// Wireless charging service
pub struct Service<R: RxController, F: FastChargeController, C: NormalCharger> {
    /// Configuration
    pub config: Config,
    /// Device status
    pub status: DeviceStatus,
    votes: Votables,
    transport: Transport,
    rx_ic: Mutex<NoopRawMutex, R>,
    fast_ic: Mutex<NoopRawMutex, F>,
    charger: Mutex<NoopRawMutex, C>,
    /// Normal charger input current limit, held while stepping
    nor: Mutex<NoopRawMutex, NormalStep>,
    /// Serializes connect, disconnect and transmit enable
    lifecycle: Mutex<NoopRawMutex, ()>,
    ic_events: Channel<NoopRawMutex, IcEvent, IC_EVENT_DEPTH>,
    rx_wake: Signal<NoopRawMutex, ()>,
    ctrl_start: Signal<NoopRawMutex, ()>,
    ctrl_stop: Signal<NoopRawMutex, ()>,
    verity_start: Signal<NoopRawMutex, VerityVariant>,
    verity_abort: Signal<NoopRawMutex, ()>,
    verity_data: Signal<NoopRawMutex, VerityData>,
    verity_request: Signal<NoopRawMutex, ()>,
    trx_kick: Signal<NoopRawMutex, ()>,
    wireless: WirelessTopic,
    diag: DiagTopic,
}

impl<R: RxController, F: FastChargeController, C: NormalCharger> Service<R, F, C> {
    /// Create a new service
    pub fn new(config: Config, rx: R, fast: F, charger: C) -> Self {
        Self {
            transport: Transport::new(config.resend_interval, config.resend_max),
            config,
            status: DeviceStatus::new(),
            votes: Votables::new(),
            rx_ic: Mutex::new(rx),
            fast_ic: Mutex::new(fast),
            charger: Mutex::new(charger),
            nor: Mutex::new(NormalStep::default()),
            lifecycle: Mutex::new(()),
            ic_events: Channel::new(),
            rx_wake: Signal::new(),
            ctrl_start: Signal::new(),
            ctrl_stop: Signal::new(),
            verity_start: Signal::new(),
            verity_abort: Signal::new(),
            verity_data: Signal::new(),
            verity_request: Signal::new(),
            trx_kick: Signal::new(),
            wireless: WirelessTopic::new("wireless"),
            diag: DiagTopic::new("diag"),
        }
    }

    /// Map an IC result, reporting failures
    pub(crate) fn bus<T, E>(&self, r: Result<T, E>) -> Result<T, Error> {
        r.map_err(|_| {
            error!("IC bus error");
            self.diag.publish(DiagEvent::IcError);
            Error::Bus
        })
    }

    /// Send a message to the transmitter
    pub(crate) async fn send(&self, msg: Message, wait: Wait) -> Result<Option<Response>, Error> {
        let r = self.transport.send(self, msg, wait).await;
        if matches!(r, Err(Error::Timeout)) {
            self.diag.publish(DiagEvent::TransportTimeout);
        }
        r
    }

    /// Queue an event from the RX IC driver
    pub async fn push_ic_event(&self, event: IcEvent) {
        self.ic_events.send(event).await;
    }

    /// Handle one IC event
    pub async fn process_ic_event(&self, event: IcEvent) {
        trace!("IC event {:?}", event);
        match event {
            IcEvent::Online => self.on_connect().await,
            IcEvent::Offline => self.on_disconnect().await,
            IcEvent::Message(frame) => self.on_message(&frame),
            IcEvent::EppCapability(power_mw) => {
                self.status.link.update(|l| l.epp_power_mw = Some(power_mw));
            }
            IcEvent::Changed => self.rx_wake.signal(()),
        }
    }

    async fn on_connect(&self) {
        let _lifecycle = self.lifecycle.lock().await;
        if self.status.online() {
            return;
        }
        let r = self.rx_ic.lock().await.is_connected().await;
        if !self.bus(r).unwrap_or(false) {
            warn!("Online event without a transmitter");
            return;
        }
        if self.status.trx.get().enabled {
            warn!("Receiver powered while transmitting");
            self.trx_stop().await;
        }

        info!("Receiver online");
        self.status.reset_session();
        self.status.conn.update(|c| {
            c.present = true;
            c.online = true;
        });
        *self.nor.lock().await = NormalStep::default();
        let r = self.rx_ic.lock().await.set_dcdc_enable(true).await;
        if self.bus(r).is_err() {
            warn!("Receiver output not enabled");
        }
        self.wireless.publish(WlsItem::Present(true));
        self.wireless.publish(WlsItem::Online(true));

        for which in Vote::ALL {
            self.rerun_election(which, false).await;
        }
        self.rx_wake.signal(());
    }

    async fn on_disconnect(&self) {
        let _lifecycle = self.lifecycle.lock().await;
        let conn = self.status.conn.get();
        if !conn.online && !conn.present {
            return;
        }

        info!("Receiver offline, keep alive {}", conn.keep_alive);
        self.status.conn.update(|c| {
            c.online = false;
            c.present = false;
        });
        self.transport.cancel();
        self.verity_abort.signal(());
        self.leave_fast_path().await;
        self.clear_session_votes(conn.keep_alive).await;
        self.status.reset_session();

        self.wireless.publish(WlsItem::Online(false));
        self.wireless.publish(WlsItem::Present(false));
        self.rx_wake.signal(());
    }

    /// Apply an acknowledgement that completed a request
    fn on_ack(&self, cmd: Command, data: [u8; 4]) {
        let [d0, d1, d2, _] = data;
        match cmd {
            Command::IdentifyAdapter => self.status.link.update(|l| {
                l.adapter_type = AdapterType::from(d0);
                l.adapter_id = d0 >> 3;
            }),
            Command::IntoFastcharge => self.status.link.update(|l| l.f2_code = Some(d0).filter(|c| *c != 0)),
            Command::GetFwVersion => self.status.link.update(|l| l.protocol_version = d0),
            Command::GetProductId => self
                .status
                .link
                .update(|l| l.product_id = Some(u16::from_be_bytes([d0, d1]))),
            Command::SetQuietMode => self.status.link.update(|l| l.tx_quiet = true),
            Command::SetNormalMode => self.status.link.update(|l| l.tx_quiet = false),
            Command::GetTxId => self.status.link.update(|l| {
                l.vendor_id = Some(d0);
                l.tx_id = Some(u16::from_be_bytes([d1, d2]));
            }),
            Command::GetTxPwr => self
                .status
                .link
                .update(|l| l.tx_power_mw = Some(u32::from(d0) * 1000)),
            _ => return,
        };
        debug!("{:?} acknowledged", cmd);
    }

    fn on_message(&self, frame: &[u8; 6]) {
        let Some(dispatched) = self.transport.dispatch(frame) else {
            return;
        };

        match dispatched.inbound {
            Inbound::Standard { data: [d0, d1, d2], .. } => {
                if let Some(cmd) = dispatched.completed {
                    self.on_ack(cmd, [d0, d1, d2, 0]);
                }
            }
            Inbound::TxResponse { data, .. } => {
                if let Some(cmd) = dispatched.completed {
                    self.on_ack(cmd, data);
                }
            }
            Inbound::Extended { code, data } => {
                if code == EXT_VENDOR_INFO {
                    let [vendor, hi, lo, _] = data;
                    self.status.link.update(|l| {
                        l.vendor_id = Some(vendor);
                        l.tx_id = Some(u16::from_be_bytes([hi, lo]));
                    });
                } else {
                    debug!("Ignoring extended frame {:#x}", code);
                }
            }
            Inbound::TxError(code) => {
                let code = TxErrorCode::from(code);
                warn!("Transmitter error: {:?}", code);
                self.diag.publish(DiagEvent::TxError(code));
                self.request_fast_exit(FastExit::TxError);
            }
        }
    }

    /// Take an update from a peer service
    pub async fn notify_peer(&self, event: PeerEvent) {
        match event {
            PeerEvent::Gauge {
                vbat_mv,
                ibat_ma,
                tbatt_dc,
                soc,
            } => {
                self.status.battery.update(|b| {
                    b.vbat_mv = vbat_mv;
                    b.ibat_ma = ibat_ma;
                    b.tbatt_dc = tbatt_dc;
                    b.soc = soc;
                });
            }
            PeerEvent::Wired { present } => {
                info!("Wired charger present {}", present);
                self.status.conn.update(|c| c.usb_present = present);
                self.vote(Vote::RxDisable, Voter::Wired, present, 1, false).await;
                if present {
                    self.trx_stop().await;
                }
            }
            PeerEvent::Common { cool_down, ui_soc } => {
                self.status.battery.update(|b| {
                    b.cool_down = cool_down;
                    b.ui_soc = ui_soc;
                });
                let cap = self.cool_down_cap();
                self.vote(Vote::FastCurr, Voter::CoolDown, cap.is_some(), cap.unwrap_or(0), false)
                    .await;
            }
            PeerEvent::BattBal { limit_ma } => {
                self.vote(
                    Vote::FastCurr,
                    Voter::BattBal,
                    limit_ma.is_some(),
                    limit_ma.unwrap_or(0),
                    false,
                )
                .await;
            }
        }
    }

    /// Current value of an item
    pub fn item(&self, id: WlsItemId) -> WlsItem {
        let conn = self.status.conn.get();
        let telemetry = self.status.rx_telemetry.get();
        match id {
            WlsItemId::Present => WlsItem::Present(conn.present),
            WlsItemId::Online => WlsItem::Online(conn.online),
            WlsItemId::WlsType => WlsItem::WlsType(self.status.link.get().wls_type),
            WlsItemId::Iout => WlsItem::Iout(telemetry.iout_ma),
            WlsItemId::Vout => WlsItem::Vout(telemetry.vout_mv),
            WlsItemId::FwUpgrading => WlsItem::FwUpgrading(conn.fw_upgrading),
            WlsItemId::TrxOnline => WlsItem::TrxOnline(self.status.trx.get().enabled),
            WlsItemId::TrxStatus => WlsItem::TrxStatus(match self.status.trx.get().state {
                TrxState::Ready => TrxStatus::Ready,
                TrxState::WaitPing => TrxStatus::DigitalPing,
                TrxState::Transfer => TrxStatus::Transfer,
                TrxState::Default | TrxState::Off => TrxStatus::Off,
            }),
            WlsItemId::ChargeDone => WlsItem::ChargeDone(self.status.charge_done.get()),
            WlsItemId::VerityPass => WlsItem::VerityPass(self.status.verity.get().pass),
            WlsItemId::RxVersion => WlsItem::RxVersion(self.status.link.get().rx_version),
            WlsItemId::TrxVout => WlsItem::TrxVout(self.status.trx.get().vout_mv),
            WlsItemId::TrxIout => WlsItem::TrxIout(self.status.trx.get().iout_ma),
        }
    }

    /// Subscribe to wireless item changes
    pub fn subscribe_wireless(&self) -> Result<WirelessSubscription<'_>, TopicError> {
        self.wireless.subscribe()
    }

    /// Subscribe to diagnostic events
    pub fn subscribe_diag(&self) -> Result<DiagSubscription<'_>, TopicError> {
        self.diag.subscribe()
    }

    /// Request quiet mode
    pub fn set_quiet_mode(&self, enable: bool) {
        self.status.settings.update(|s| s.quiet_mode = enable);
        self.rx_wake.signal(());
    }

    /// Enter or leave factory test mode
    pub fn set_ftm_mode(&self, enable: bool) {
        self.status.settings.update(|s| s.ftm_mode = enable);
        self.rx_wake.signal(());
    }

    /// Force the receiver output, `None` returns to normal operation
    pub fn set_debug(&self, debug: Option<DebugSettings>) {
        self.status.settings.update(|s| s.debug = debug);
        self.rx_wake.signal(());
    }

    /// Magnetic cover attached
    pub fn set_mag_cover(&self, attached: bool) {
        self.status.settings.update(|s| s.mag_cover = attached);
    }

    /// Enable or disable the receive path
    pub async fn set_rx_enable(&self, enable: bool) {
        self.vote(Vote::RxDisable, Voter::User, !enable, 1, false).await;
    }

    /// Limit the fast charge current, `None` removes the limit
    pub async fn set_user_current_limit(&self, limit_ma: Option<u32>) {
        self.vote(Vote::FastCurr, Voter::User, limit_ma.is_some(), limit_ma.unwrap_or(0), false)
            .await;
    }

    /// Receiver firmware upgrade in progress, the receive path is held off meanwhile
    pub async fn set_fw_upgrading(&self, upgrading: bool) {
        self.status.conn.update(|c| c.fw_upgrading = upgrading);
        self.wireless.publish(WlsItem::FwUpgrading(upgrading));
        self.vote(Vote::RxDisable, Voter::FwUpgrade, upgrading, 1, false).await;
    }

    async fn dock_command(&self, cmd: Command, value: u8) -> Result<(), Error> {
        self.send(Message::with_data(cmd, [value, 0, 0]), Wait::Timeout(self.config.msg_wait))
            .await
            .map(|_| ())
    }

    /// Set the dock LED brightness
    pub async fn set_led_brightness(&self, brightness: u8) -> Result<(), Error> {
        self.dock_command(Command::SetLedBrightness, brightness).await
    }

    /// Set the dock fan speed
    pub async fn set_fan_speed(&self, speed: u8) -> Result<(), Error> {
        self.dock_command(Command::SetFanSpeed, speed).await
    }

    /// Ask the transmitter how much power it can deliver
    pub async fn query_tx_power(&self) -> Result<Option<u32>, Error> {
        self.send(Message::new(Command::GetTxPwr), Wait::Timeout(self.config.msg_wait))
            .await?;
        Ok(self.status.link.get().tx_power_mw)
    }

    /// Read the dock product id
    pub async fn query_product_id(&self) -> Result<Option<u16>, Error> {
        self.send(Message::new(Command::GetProductId), Wait::Timeout(self.config.msg_wait))
            .await?;
        Ok(self.status.link.get().product_id)
    }

    async fn run_events(&self) {
        loop {
            let event = self.ic_events.receive().await;
            self.process_ic_event(event).await;
        }
    }

    /// Run the service
    pub async fn run(&self) {
        info!("Starting wireless charging service");
        join(
            join3(self.run_events(), self.run_rx(), self.run_control()),
            join3(self.run_verity(), self.run_trx(), self.transport.run_resend(self)),
        )
        .await;
    }
}

impl<R: RxController, F: FastChargeController, C: NormalCharger> Link for Service<R, F, C> {
    async fn write(&self, frame: &Frame) -> Result<(), Error> {
        let r = self.rx_ic.lock().await.send_msg(frame.as_bytes(), frame.raw).await;
        self.bus(r)
    }

    fn online(&self) -> bool {
        self.status.online()
    }
}

#[cfg(test)]
mod test {
    use embassy_futures::block_on;
    use embedded_services::power::wireless::{RxMode, WlsType};

    use super::*;
    use crate::rx::RxState;
    use crate::test_util::*;

    #[test]
    fn test_connect_and_disconnect() {
        let hw = Hw::new();
        hw.rx_mode.set(RxMode::Epp);
        let service = service(&hw);
        let mut sub = service.subscribe_wireless().unwrap();

        block_on(async {
            service.process_ic_event(IcEvent::Online).await;
            assert!(service.status.online());
            assert!(hw.dcdc_enabled.get());
            assert_eq!(service.item(WlsItemId::Online), WlsItem::Online(true));
            assert_eq!(sub.try_next_message_pure(), Some(WlsItem::Present(true)));
            assert_eq!(sub.try_next_message_pure(), Some(WlsItem::Online(true)));

            while !(service.status.rx.get().current == RxState::Epp && service.status.rx.get().entered) {
                step(&service, &hw).await;
            }
            service.vote(Vote::NorIcl, Voter::Quiet, true, 200, false).await;
            service.vote(Vote::FastCurr, Voter::User, true, 3000, false).await;

            service.process_ic_event(IcEvent::Offline).await;
        });

        assert!(!service.status.online());
        assert_eq!(service.status.link.get().wls_type, WlsType::Unknown);
        assert_eq!(service.status.rx.get().current, RxState::Default);
        // Session votes are gone, user votes stay
        assert_eq!(service.client_vote(Vote::NorIcl, Voter::Quiet), None);
        assert_eq!(service.client_vote(Vote::FastCurr, Voter::User), Some(3000));
    }

    #[test]
    fn test_online_without_transmitter_is_ignored() {
        let hw = Hw::new();
        hw.connected.set(false);
        let service = service(&hw);
        block_on(service.process_ic_event(IcEvent::Online));
        assert!(!service.status.online());
        assert!(!hw.dcdc_enabled.get());
        assert_eq!(service.item(WlsItemId::RxVersion), WlsItem::RxVersion(None));
    }

    #[test]
    fn test_late_ack_has_no_effect() {
        let hw = Hw::new();
        let service = service(&hw);
        connect(&service, &hw);
        // Identify response with no request pending
        service.on_message(&[0x1f, 0xf1, !0xf1, 0x1a, 0, 0]);
        assert_eq!(service.status.link.get().adapter_type, AdapterType::Unknown);

        // Transmitter initiated frames always apply
        service.on_message(&[0x5f, EXT_VENDOR_INFO, 0x07, 0x12, 0x34, 0]);
        let link = service.status.link.get();
        assert_eq!(link.vendor_id, Some(0x07));
        assert_eq!(link.tx_id, Some(0x1234));
    }

    #[test]
    fn test_tx_error_requests_fast_exit() {
        let hw = Hw::new();
        let service = service(&hw);
        connect(&service, &hw);
        service.status.fast.update(|f| f.running = true);
        let mut diag = service.subscribe_diag().unwrap();
        service.on_message(&[0x3f, 0x01, 0, 0, 0, 0]);
        assert_eq!(
            diag.try_next_message_pure(),
            Some(DiagEvent::TxError(TxErrorCode::OverTemperature))
        );
        assert_eq!(service.status.fast.get().exit, Some(FastExit::TxError));
    }

    #[test]
    fn test_wired_disables_rx() {
        let hw = Hw::new();
        let service = service(&hw);
        block_on(async {
            service.notify_peer(PeerEvent::Wired { present: true }).await;
            assert!(!hw.rx_enabled.get());
            assert_eq!(service.set_trx_enable(true).await, Err(Error::InvalidState));
            service.notify_peer(PeerEvent::Wired { present: false }).await;
        });
        assert!(hw.rx_enabled.get());
    }

    #[test]
    fn test_peer_limits_feed_fast_current() {
        let hw = Hw::new();
        let service = service(&hw);
        block_on(async {
            service.vote(Vote::FastCurr, Voter::Max, true, 6000, false).await;
            service
                .notify_peer(PeerEvent::Common {
                    cool_down: 3,
                    ui_soc: 40,
                })
                .await;
            assert_eq!(service.status.fast.get().target_curr_ma, service.config.cool_down_curr_ma[3]);

            service.notify_peer(PeerEvent::BattBal { limit_ma: Some(1200) }).await;
            assert_eq!(service.status.fast.get().target_curr_ma, 1200);

            service.notify_peer(PeerEvent::BattBal { limit_ma: None }).await;
            service.notify_peer(PeerEvent::Common { cool_down: 0, ui_soc: 40 }).await;
        });
        assert_eq!(service.status.fast.get().target_curr_ma, 6000);
        assert_eq!(service.status.battery.get().ui_soc, 40);
    }

    #[test]
    fn test_tx_power_query() {
        let hw = Hw::new();
        hw.tx_power.set(15);
        let service = service(&hw);
        connect(&service, &hw);
        let power = block_on(with_pump(&service, &hw, service.query_tx_power())).unwrap();
        assert_eq!(power, Some(15000));
    }

    #[test]
    fn test_fw_upgrade_holds_rx_off() {
        let hw = Hw::new();
        let service = service(&hw);
        block_on(service.set_fw_upgrading(true));
        assert!(!hw.rx_enabled.get());
        assert_eq!(service.item(WlsItemId::FwUpgrading), WlsItem::FwUpgrading(true));
        block_on(service.set_fw_upgrading(false));
        assert!(hw.rx_enabled.get());
    }
}
