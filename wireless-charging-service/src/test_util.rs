//! Mock hardware and helpers shared by the unit tests
extern crate std;

use core::cell::{Cell, RefCell};
use core::convert::Infallible;
use core::future::Future;
use std::collections::VecDeque;
use std::vec::Vec;

use embassy_futures::join::join3;
use embassy_futures::select::{select, Either};
use embassy_time::{Duration, Instant, Timer};
use embedded_services::power::wireless::{
    FastChargeController, FodMode, IcEvent, NormalCharger, RxController, RxMode, TrxError, TrxStatus,
};

use crate::config::Config;
use crate::Service;

/// Simulated state of the RX IC, charge pump and charger
pub struct Hw {
    pub rx_enabled: Cell<bool>,
    pub vout_mv: Cell<u32>,
    pub iout_ma: Cell<u32>,
    pub vrect_mv: Cell<u32>,
    pub cep: Cell<i32>,
    pub rx_mode: Cell<RxMode>,
    /// Identify response byte, type in the low bits and id above
    pub adapter: Cell<u8>,
    /// Fast charge entry response code
    pub f2: Cell<u8>,
    pub vendor: Cell<u8>,
    pub tx_id: Cell<u16>,
    /// Transmitter power in W
    pub tx_power: Cell<u8>,
    /// Authentication replies are the challenge XORed with this
    pub verity_xor: Cell<u8>,
    /// Queue a transmitter reply for every frame sent
    pub auto_reply: Cell<bool>,
    pub sent: RefCell<Vec<[u8; 5]>>,
    pub replies: RefCell<VecDeque<[u8; 6]>>,
    pub fod_mode: Cell<Option<FodMode>>,
    pub match_q: Cell<Option<[u8; 2]>>,
    pub comu: Cell<u8>,
    /// Reported by the connection check
    pub connected: Cell<bool>,
    pub dcdc_enabled: Cell<bool>,
    pub trx_vol_mv: Cell<u32>,
    pub trx_curr_ma: Cell<u32>,
    pub insert_disable: Cell<bool>,
    pub trx_enabled: Cell<bool>,
    pub trx_status: Cell<TrxStatus>,
    pub trx_err: Cell<TrxError>,
    pub cp_enabled: Cell<bool>,
    pub cp_started: Cell<bool>,
    pub icl_history: RefCell<Vec<u32>>,
    pub fcc_ma: Cell<u32>,
    pub fv_mv: Cell<u32>,
    pub input_suspend: Cell<bool>,
    pub charge_enabled: Cell<bool>,
    pub aicl_reruns: Cell<u32>,
    /// Every bus operation fails
    pub fail_bus: Cell<bool>,
}

impl Hw {
    pub fn new() -> Self {
        Self {
            rx_enabled: Cell::new(true),
            vout_mv: Cell::new(5000),
            iout_ma: Cell::new(1000),
            vrect_mv: Cell::new(10000),
            cep: Cell::new(0),
            rx_mode: Cell::new(RxMode::Bpp),
            adapter: Cell::new(0),
            f2: Cell::new(0x02),
            vendor: Cell::new(0),
            tx_id: Cell::new(0x0301),
            tx_power: Cell::new(0),
            verity_xor: Cell::new(0),
            auto_reply: Cell::new(true),
            sent: RefCell::new(Vec::new()),
            replies: RefCell::new(VecDeque::new()),
            fod_mode: Cell::new(None),
            match_q: Cell::new(None),
            comu: Cell::new(0),
            connected: Cell::new(true),
            dcdc_enabled: Cell::new(false),
            trx_vol_mv: Cell::new(5000),
            trx_curr_ma: Cell::new(0),
            insert_disable: Cell::new(false),
            trx_enabled: Cell::new(false),
            trx_status: Cell::new(TrxStatus::Off),
            trx_err: Cell::new(TrxError::NONE),
            cp_enabled: Cell::new(false),
            cp_started: Cell::new(false),
            icl_history: RefCell::new(Vec::new()),
            fcc_ma: Cell::new(0),
            fv_mv: Cell::new(0),
            input_suspend: Cell::new(false),
            charge_enabled: Cell::new(true),
            aicl_reruns: Cell::new(0),
            fail_bus: Cell::new(false),
        }
    }

    fn bus(&self) -> Result<(), ()> {
        if self.fail_bus.get() {
            Err(())
        } else {
            Ok(())
        }
    }

    /// Returns true if a standard frame with this command code was sent
    pub fn sent_cmd(&self, code: u8) -> bool {
        self.count_cmd(code) > 0
    }

    /// Number of standard frames sent with this command code
    pub fn count_cmd(&self, code: u8) -> usize {
        self.sent.borrow().iter().filter(|f| f[0] == 0x48 && f[1] == code).count()
    }

    fn standard_reply(&self, ack: u8, data: [u8; 3]) {
        self.replies
            .borrow_mut()
            .push_back([0x1f, ack, !ack, data[0], data[1], data[2]]);
    }

    fn challenge_reply(&self, ack: u8, challenge: &[u8]) {
        let xor = self.verity_xor.get();
        self.standard_reply(ack, [challenge[0] ^ xor, challenge[1] ^ xor, challenge[2] ^ xor]);
    }

    /// Queue what a transmitter would answer to `msg`
    fn reply(&self, msg: &[u8; 5], raw: bool) {
        let [head, code, ..] = *msg;
        if raw {
            if (0xd1..=0xd6).contains(&head) {
                self.challenge_reply(head - 0xd0 + 0xe0, &msg[1..4]);
            }
            return;
        }

        match (head, code) {
            (0x18, 0x5f) => {
                let [hi, lo] = self.tx_id.get().to_be_bytes();
                self.replies
                    .borrow_mut()
                    .push_back([0x2f, 0x5f, self.vendor.get(), hi, lo, 0]);
            }
            (0x18, 0x4a) => {
                self.replies
                    .borrow_mut()
                    .push_back([0x2f, 0x4a, self.tx_power.get(), 0, 0, 0]);
            }
            // Battery reports are not acknowledged
            (0x48, 0xaf) => (),
            (0x48, 0xb1..=0xb6) => self.challenge_reply(code - 0xb0 + 0xc0, &msg[2..5]),
            (0x48, _) => {
                let d0 = match code {
                    0xa1 => self.adapter.get(),
                    0xa2 => self.f2.get(),
                    _ => 0,
                };
                self.standard_reply(code | 0xf0, [d0, 0, 0]);
            }
            _ => (),
        }
    }
}

pub struct MockRx<'a>(&'a Hw);

impl RxController for MockRx<'_> {
    type BusError = ();

    async fn is_connected(&mut self) -> Result<bool, ()> {
        self.0.bus()?;
        Ok(self.0.connected.get())
    }

    async fn set_rx_enable(&mut self, enable: bool) -> Result<(), ()> {
        self.0.bus()?;
        self.0.rx_enabled.set(enable);
        Ok(())
    }

    async fn get_vout(&mut self) -> Result<u32, ()> {
        self.0.bus()?;
        Ok(self.0.vout_mv.get())
    }

    async fn set_vout(&mut self, vout_mv: u32) -> Result<(), ()> {
        self.0.bus()?;
        self.0.vout_mv.set(vout_mv);
        Ok(())
    }

    async fn get_vrect(&mut self) -> Result<u32, ()> {
        self.0.bus()?;
        Ok(self.0.vrect_mv.get())
    }

    async fn get_iout(&mut self) -> Result<u32, ()> {
        self.0.bus()?;
        Ok(self.0.iout_ma.get())
    }

    async fn get_cep(&mut self) -> Result<i32, ()> {
        self.0.bus()?;
        Ok(self.0.cep.get())
    }

    async fn get_rx_mode(&mut self) -> Result<RxMode, ()> {
        self.0.bus()?;
        Ok(self.0.rx_mode.get())
    }

    async fn set_rx_mode(&mut self, mode: RxMode) -> Result<(), ()> {
        self.0.bus()?;
        self.0.rx_mode.set(mode);
        Ok(())
    }

    async fn set_dcdc_enable(&mut self, enable: bool) -> Result<(), ()> {
        self.0.bus()?;
        self.0.dcdc_enabled.set(enable);
        Ok(())
    }

    async fn send_msg(&mut self, msg: &[u8], raw: bool) -> Result<(), ()> {
        self.0.bus()?;
        let mut frame = [0u8; 5];
        let len = msg.len().min(5);
        frame[..len].copy_from_slice(&msg[..len]);
        self.0.sent.borrow_mut().push(frame);
        if self.0.auto_reply.get() {
            self.0.reply(&frame, raw);
        }
        Ok(())
    }

    async fn set_fod_parm(&mut self, _parm: &[u8], mode: FodMode, _magcvr: bool) -> Result<(), ()> {
        self.0.bus()?;
        self.0.fod_mode.set(Some(mode));
        Ok(())
    }

    async fn send_match_q(&mut self, q: [u8; 2]) -> Result<(), ()> {
        self.0.bus()?;
        self.0.match_q.set(Some(q));
        Ok(())
    }

    async fn set_rx_comu(&mut self, comu: u8) -> Result<(), ()> {
        self.0.bus()?;
        self.0.comu.set(comu);
        Ok(())
    }

    async fn set_insert_disable(&mut self, disable: bool) -> Result<(), ()> {
        self.0.bus()?;
        self.0.insert_disable.set(disable);
        Ok(())
    }

    async fn get_rx_version(&mut self) -> Result<u32, ()> {
        self.0.bus()?;
        Ok(0x0102)
    }

    async fn get_trx_status(&mut self) -> Result<TrxStatus, ()> {
        self.0.bus()?;
        Ok(self.0.trx_status.get())
    }

    async fn get_trx_err(&mut self) -> Result<TrxError, ()> {
        self.0.bus()?;
        Ok(self.0.trx_err.get())
    }

    async fn get_trx_vol(&mut self) -> Result<u32, ()> {
        self.0.bus()?;
        Ok(self.0.trx_vol_mv.get())
    }

    async fn get_trx_curr(&mut self) -> Result<u32, ()> {
        self.0.bus()?;
        Ok(self.0.trx_curr_ma.get())
    }

    async fn set_trx_enable(&mut self, enable: bool) -> Result<(), ()> {
        self.0.bus()?;
        self.0.trx_enabled.set(enable);
        Ok(())
    }

    async fn set_trx_start(&mut self, _start: bool) -> Result<(), ()> {
        self.0.bus()
    }
}

pub struct MockCp<'a>(&'a Hw);

impl FastChargeController for MockCp<'_> {
    type BusError = ();

    async fn set_enable(&mut self, enable: bool) -> Result<(), ()> {
        self.0.bus()?;
        self.0.cp_enabled.set(enable);
        if !enable {
            self.0.cp_started.set(false);
        }
        Ok(())
    }

    async fn start(&mut self, start: bool) -> Result<(), ()> {
        self.0.bus()?;
        self.0.cp_started.set(start && self.0.cp_enabled.get());
        Ok(())
    }

    async fn is_started(&mut self) -> Result<bool, ()> {
        self.0.bus()?;
        Ok(self.0.cp_started.get())
    }
}

pub struct MockCharger<'a>(&'a Hw);

impl NormalCharger for MockCharger<'_> {
    type BusError = ();

    async fn set_icl(&mut self, icl_ma: u32) -> Result<(), ()> {
        self.0.bus()?;
        self.0.icl_history.borrow_mut().push(icl_ma);
        Ok(())
    }

    async fn set_fcc(&mut self, fcc_ma: u32) -> Result<(), ()> {
        self.0.bus()?;
        self.0.fcc_ma.set(fcc_ma);
        Ok(())
    }

    async fn set_fv(&mut self, fv_mv: u32) -> Result<(), ()> {
        self.0.bus()?;
        self.0.fv_mv.set(fv_mv);
        Ok(())
    }

    async fn set_input_suspend(&mut self, suspend: bool) -> Result<(), ()> {
        self.0.bus()?;
        self.0.input_suspend.set(suspend);
        Ok(())
    }

    async fn set_charge_enable(&mut self, enable: bool) -> Result<(), ()> {
        self.0.bus()?;
        self.0.charge_enabled.set(enable);
        Ok(())
    }

    async fn rerun_aicl(&mut self) -> Result<(), ()> {
        self.0.bus()?;
        self.0.aicl_reruns.set(self.0.aicl_reruns.get() + 1);
        Ok(())
    }
}

pub type TestService<'a> = Service<MockRx<'a>, MockCp<'a>, MockCharger<'a>>;

/// Defaults with timings shortened for tests
pub fn test_config() -> Config {
    Config {
        msg_wait: Duration::from_millis(20),
        resend_interval: Duration::from_millis(10),
        nor_icl_step_delay: Duration::from_millis(1),
        rx_poll_interval: Duration::from_millis(10),
        wait_fast_timeout: Duration::from_millis(50),
        wait_vout_timeout: Duration::from_millis(200),
        fast_enter_interval: Duration::from_millis(1),
        fast_poll_interval: Duration::from_millis(10),
        fast_vbat_max_mv: 9000,
        ctrl_period: Duration::from_millis(10),
        verity_deadline: Duration::from_millis(250),
        verity_data_wait: Duration::from_millis(50),
        verity_chunk_retry: 5,
        verity_chunk_wait: Duration::from_millis(40),
        verity_backoff: Duration::from_millis(20),
        verity_power_cycle: Duration::from_millis(20),
        verity_keep_clear_delay: Duration::from_millis(20),
        trx_poll_interval: Duration::from_millis(10),
        trx_retry_delay: Duration::from_millis(20),
        ..Config::default()
    }
}

pub fn service(hw: &Hw) -> TestService<'_> {
    service_with(hw, test_config())
}

pub fn service_with(hw: &Hw, config: Config) -> TestService<'_> {
    Service::new(config, MockRx(hw), MockCp(hw), MockCharger(hw))
}

/// Mark the receiver online without running the connect sequence
pub fn connect(service: &TestService<'_>, hw: &Hw) {
    service.status.reset_session();
    service.status.conn.update(|c| {
        c.present = true;
        c.online = true;
    });
    hw.rx_enabled.set(true);
    hw.dcdc_enabled.set(true);
}

pub async fn disconnect(service: &TestService<'_>) {
    service.process_ic_event(IcEvent::Offline).await;
}

/// Deliver queued transmitter replies
pub fn pump(service: &TestService<'_>, hw: &Hw) {
    loop {
        let Some(frame) = hw.replies.borrow_mut().pop_front() else {
            break;
        };
        service.on_message(&frame);
    }
}

async fn pump_loop(service: &TestService<'_>, hw: &Hw) -> Infallible {
    loop {
        pump(service, hw);
        Timer::after_millis(1).await;
    }
}

/// Run `fut` while delivering replies
pub async fn with_pump<T>(service: &TestService<'_>, hw: &Hw, fut: impl Future<Output = T>) -> T {
    match select(fut, pump_loop(service, hw)).await {
        Either::First(r) => r,
        Either::Second(never) => match never {},
    }
}

/// One step of the RX state machine
pub async fn step(service: &TestService<'_>, hw: &Hw) {
    with_pump(service, hw, service.rx_step()).await;
    pump(service, hw);
}

/// Reply delivery, authentication and resends
pub async fn run_background(service: &TestService<'_>, hw: &Hw) {
    join3(
        pump_loop(service, hw),
        service.run_verity(),
        service.transport.run_resend(service),
    )
    .await;
}

/// Wait for a condition, failing the test after a while
pub async fn wait_until(f: impl Fn() -> bool) {
    let start = Instant::now();
    while !f() {
        assert!(Instant::now() - start < Duration::from_secs(5), "condition not reached");
        Timer::after_millis(1).await;
    }
}
