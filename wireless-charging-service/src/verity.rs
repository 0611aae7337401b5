//! Transmitter authentication
//!
//! The whole sequence runs under one wall-clock deadline. Per-step retries never extend
//! it and a disconnect aborts it immediately.
use embassy_futures::select::{select, Either};
use embassy_time::{with_deadline, with_timeout, Instant, Timer};
use embedded_services::power::wireless::{Error, FastChargeController, NormalCharger, RxController};
use embedded_services::{debug, error, info, warn};

use crate::protocol::message::VERITY_CHUNKS;
use crate::protocol::{Command, Message, Wait};
use crate::topic::{DiagEvent, WlsItem};
use crate::voter::{Vote, Voter};
use crate::Service;

/// Bytes in a challenge or its expected response
pub const VERITY_LEN: usize = 18;

/// Bytes per chunk
const CHUNK_LEN: usize = 3;

/// Authentication protocol variant
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum VerityVariant {
    /// First party challenge/response
    Legacy,
    /// AES based third party variant
    Aes,
}

impl VerityVariant {
    /// Variant used with a transmitter vendor
    pub fn for_vendor(vendor_id: Option<u8>) -> Self {
        match vendor_id {
            Some(vendor) if vendor != 0 => VerityVariant::Aes,
            _ => VerityVariant::Legacy,
        }
    }

    fn command(self, chunk: u8) -> Command {
        match self {
            VerityVariant::Legacy => Command::EncryptData(chunk),
            VerityVariant::Aes => Command::AesData(chunk),
        }
    }
}

/// Authentication input data
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct VerityData {
    /// Challenge sent to the transmitter
    pub challenge: [u8; VERITY_LEN],
    /// Response the transmitter has to produce
    pub expected: [u8; VERITY_LEN],
}

/// Progress of the authentication sequence
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum VerityStage {
    /// Not started
    #[default]
    Idle,
    /// Waiting for input data
    DataRequested,
    /// Sending a chunk, 1 based
    Chunk(u8),
    /// Comparing the response
    Compare,
    /// Finished
    Done,
}

/// Authentication status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct VerityStatus {
    /// Sequence started this session
    pub started: bool,
    /// Sequence finished
    pub done: bool,
    /// Last comparison result
    pub pass: bool,
    /// Input data received
    pub data_ok: bool,
    /// Current stage
    pub stage: VerityStage,
    /// Input data requests made
    pub data_requests: u8,
    /// Chunk attempts made in total
    pub chunk_attempts: u8,
}

impl<R: RxController, F: FastChargeController, C: NormalCharger> Service<R, F, C> {
    /// Start authentication if this session needs it and it has not run yet
    pub(crate) fn kick_verity(&self) {
        let link = self.status.link.get();
        let verity = self.status.verity.get();
        if !link.wls_type.is_fast() || verity.started || verity.done {
            return;
        }
        self.status.verity.update(|v| v.started = true);
        self.verity_start.signal(VerityVariant::for_vendor(link.vendor_id));
    }

    /// Supply authentication input data
    pub fn provide_verity_data(&self, data: VerityData) {
        self.verity_data.signal(data);
    }

    /// Wait until authentication input data is requested
    pub async fn wait_verity_request(&self) {
        self.verity_request.wait().await;
    }

    fn verity_online(&self) -> Result<(), Error> {
        if self.status.online() {
            Ok(())
        } else {
            Err(Error::Cancelled)
        }
    }

    /// Obtain input data, requesting it again on every attempt
    async fn verity_request_data(&self) -> Result<Option<VerityData>, Error> {
        for _ in 0..self.config.verity_data_retry {
            self.verity_online()?;
            self.status.verity.update(|v| {
                v.stage = VerityStage::DataRequested;
                v.data_requests = v.data_requests.saturating_add(1);
            });
            self.verity_request.signal(());
            if let Ok(data) = with_timeout(self.config.verity_data_wait, self.verity_data.wait()).await {
                self.status.verity.update(|v| v.data_ok = true);
                return Ok(Some(data));
            }
            warn!("Authentication data not provided");
        }
        Ok(None)
    }

    /// Send one chunk and return the transmitter's reply bytes
    async fn verity_chunk(
        &self,
        variant: VerityVariant,
        chunk: u8,
        data: [u8; CHUNK_LEN],
    ) -> Result<Option<[u8; CHUNK_LEN]>, Error> {
        let msg = Message::with_data(variant.command(chunk), data);
        for attempt in 0..self.config.verity_chunk_retry {
            self.verity_online()?;
            self.status.verity.update(|v| {
                v.stage = VerityStage::Chunk(chunk);
                v.chunk_attempts = v.chunk_attempts.saturating_add(1);
            });
            match self.send(msg, Wait::Timeout(self.config.verity_chunk_wait)).await {
                Ok(Some(response)) => {
                    let [d0, d1, d2, _] = response.data;
                    return Ok(Some([d0, d1, d2]));
                }
                Ok(None) => return Err(Error::InvalidResponse),
                Err(Error::Offline | Error::Cancelled) => return Err(Error::Cancelled),
                Err(e) => debug!("Chunk {} attempt {} failed: {:?}", chunk, attempt, e),
            }
            Timer::after(self.config.verity_backoff).await;
        }
        Ok(None)
    }

    /// Run the authentication sequence and return the comparison result
    async fn verity_sequence(&self, variant: VerityVariant) -> Result<bool, Error> {
        let Some(data) = self.verity_request_data().await? else {
            return Ok(false);
        };

        let mut response = [0u8; VERITY_LEN];
        for chunk in 1..=VERITY_CHUNKS {
            let start = (chunk as usize - 1) * CHUNK_LEN;
            let mut bytes = [0u8; CHUNK_LEN];
            bytes.copy_from_slice(&data.challenge[start..start + CHUNK_LEN]);
            match self.verity_chunk(variant, chunk, bytes).await? {
                Some(reply) => response[start..start + CHUNK_LEN].copy_from_slice(&reply),
                None => {
                    warn!("Authentication chunk {} not acknowledged", chunk);
                    return Ok(false);
                }
            }
        }

        self.status.verity.update(|v| v.stage = VerityStage::Compare);
        let pass = response == data.expected;
        self.status.verity.update(|v| v.pass = pass);
        Ok(pass)
    }

    async fn verity_finish(&self, pass: bool) {
        self.status.verity.update(|v| {
            v.done = true;
            v.pass = pass;
            v.stage = VerityStage::Done;
        });
        self.wireless.publish(WlsItem::VerityPass(pass));
        if pass {
            info!("Transmitter authenticated");
            return;
        }

        error!("Transmitter authentication failed");
        self.diag.publish(DiagEvent::VerityFail);
        self.vote(Vote::FastCurr, Voter::Verity, true, self.config.verity_fail_curr_ma, false)
            .await;

        // Power cycle the receive path without ending the session
        self.status.conn.update(|c| c.keep_alive = true);
        self.vote(Vote::RxDisable, Voter::Verity, true, 1, false).await;
        Timer::after(self.config.verity_power_cycle).await;
        self.vote(Vote::RxDisable, Voter::Verity, false, 0, false).await;
        Timer::after(self.config.verity_keep_clear_delay).await;
        self.status.conn.update(|c| c.keep_alive = false);
    }

    /// Authentication loop
    pub async fn run_verity(&self) {
        loop {
            let variant = self.verity_start.wait().await;
            self.verity_abort.reset();
            info!("Starting authentication: {:?}", variant);

            let deadline = Instant::now() + self.config.verity_deadline;
            let result = select(
                with_deadline(deadline, self.verity_sequence(variant)),
                self.verity_abort.wait(),
            )
            .await;

            match result {
                Either::First(Ok(Ok(pass))) => self.verity_finish(pass).await,
                Either::First(Err(_)) => {
                    warn!("Authentication deadline expired");
                    let pass = self.status.verity.get().pass;
                    self.verity_finish(pass).await;
                }
                Either::First(Ok(Err(e))) => debug!("Authentication aborted: {:?}", e),
                Either::Second(()) => debug!("Authentication aborted by disconnect"),
            }
        }
    }
}
