//! Votables of the wireless charging service and how their results reach hardware
use embassy_sync::blocking_mutex::raw::NoopRawMutex;
use embassy_time::Timer;
use embedded_services::power::wireless::{Error, FastChargeController, NormalCharger, RxController};
use embedded_services::vote::{Election, Elector, VoteKind, Votable};
use embedded_services::{debug, error, trace};

use crate::Service;

/// Clients that may vote
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Voter {
    /// Control surface
    User,
    /// Negotiated power ceiling
    Max,
    /// Base charging profile
    Base,
    /// Current ramp step
    Step,
    /// Fast charge path
    Fast,
    /// Link stability
    Skew,
    /// Authentication
    Verity,
    /// Thermal cool down
    CoolDown,
    /// Battery balancing
    BattBal,
    /// Quiet mode
    Quiet,
    /// Debug override
    Debug,
    /// Factory test mode
    Ftm,
    /// Full fast charge
    Ffc,
    /// Charge complete
    Done,
    /// Temperature stop
    Stop,
    /// Error state
    Error,
    /// Wired charger attached
    Wired,
    /// Receiver firmware upgrade
    FwUpgrade,
    /// Transmit path
    Trx,
    /// Fast charge exit policy
    Exit,
}

/// Maximum number of voters on one votable
pub const MAX_VOTERS: usize = 20;

/// Voters whose votes only last for one charging session
pub const SESSION_VOTERS: &[Voter] = &[
    Voter::Max,
    Voter::Base,
    Voter::Step,
    Voter::Fast,
    Voter::Skew,
    Voter::Quiet,
    Voter::Debug,
    Voter::Ftm,
    Voter::Ffc,
    Voter::Done,
    Voter::Stop,
    Voter::Error,
    Voter::Exit,
];

/// Votable type used by the service
pub type WlsVotable = Votable<NoopRawMutex, Voter, MAX_VOTERS>;

/// Identifies a votable
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Vote {
    /// Fast charge battery current
    FastCurr,
    /// Fast charge disabled
    FastDisable,
    /// Receiver disabled
    RxDisable,
    /// Normal charger input current limit
    NorIcl,
    /// Normal charger charge current
    NorFcc,
    /// Normal charger float voltage
    NorFv,
    /// Normal charger output disabled
    NorOutDisable,
    /// Normal charger input suspended
    NorInputDisable,
    /// Receiver communication capability
    RxComu,
    /// Receiver insertion detection disabled
    InsertDisable,
}

impl Vote {
    /// All votables
    pub const ALL: [Vote; 10] = [
        Vote::FastCurr,
        Vote::FastDisable,
        Vote::RxDisable,
        Vote::NorIcl,
        Vote::NorFcc,
        Vote::NorFv,
        Vote::NorOutDisable,
        Vote::NorInputDisable,
        Vote::RxComu,
        Vote::InsertDisable,
    ];
}

/// All votables owned by the service
pub struct Votables {
    fast_curr: WlsVotable,
    fast_disable: WlsVotable,
    rx_disable: WlsVotable,
    nor_icl: WlsVotable,
    nor_fcc: WlsVotable,
    nor_fv: WlsVotable,
    nor_out_disable: WlsVotable,
    nor_input_disable: WlsVotable,
    rx_comu: WlsVotable,
    insert_disable: WlsVotable,
}

impl Votables {
    /// Create the votables
    pub const fn new() -> Self {
        Self {
            fast_curr: Votable::new("FAST_CURR", VoteKind::Min),
            fast_disable: Votable::new("FAST_DISABLE", VoteKind::SetAny),
            rx_disable: Votable::new("RX_DISABLE", VoteKind::SetAny),
            nor_icl: Votable::new("NOR_ICL", VoteKind::Min),
            nor_fcc: Votable::new("NOR_FCC", VoteKind::Min),
            nor_fv: Votable::new("NOR_FV", VoteKind::Min),
            nor_out_disable: Votable::new("NOR_OUT_DISABLE", VoteKind::SetAny),
            nor_input_disable: Votable::new("NOR_INPUT_DISABLE", VoteKind::SetAny),
            rx_comu: Votable::new("RX_COMU", VoteKind::Max),
            insert_disable: Votable::new("INSERT_DISABLE", VoteKind::SetAny),
        }
    }

    /// Get a votable
    pub fn get(&self, which: Vote) -> &WlsVotable {
        match which {
            Vote::FastCurr => &self.fast_curr,
            Vote::FastDisable => &self.fast_disable,
            Vote::RxDisable => &self.rx_disable,
            Vote::NorIcl => &self.nor_icl,
            Vote::NorFcc => &self.nor_fcc,
            Vote::NorFv => &self.nor_fv,
            Vote::NorOutDisable => &self.nor_out_disable,
            Vote::NorInputDisable => &self.nor_input_disable,
            Vote::RxComu => &self.rx_comu,
            Vote::InsertDisable => &self.insert_disable,
        }
    }
}

impl Default for Votables {
    fn default() -> Self {
        Self::new()
    }
}

/// Input current limit applied to the normal charger
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct NormalStep {
    /// Last applied limit, `None` until the first write
    pub icl_ma: Option<u32>,
}

/// Applies election results of one votable
pub(crate) struct Apply<'a, R: RxController, F: FastChargeController, C: NormalCharger> {
    service: &'a Service<R, F, C>,
    which: Vote,
}

impl<R: RxController, F: FastChargeController, C: NormalCharger> Elector<Voter> for Apply<'_, R, F, C> {
    type Error = Error;

    async fn elected(&self, election: Election<Voter>) -> Result<(), Error> {
        let service = self.service;
        let set = election.value.is_some_and(|v| v != 0);
        let value = election.value.map(|v| v.max(0) as u32);
        debug!("{:?} elected {:?} from {:?}", self.which, election.value, election.client);

        match self.which {
            Vote::FastCurr => {
                let curr_ma = value.unwrap_or(service.config.batt_max_curr_ma);
                service.status.fast.update(|f| f.target_curr_ma = curr_ma);
                Ok(())
            }
            Vote::FastDisable => {
                service.rx_wake.signal(());
                Ok(())
            }
            Vote::RxDisable => {
                let r = service.rx_ic.lock().await.set_rx_enable(!set).await;
                service.bus(r)
            }
            Vote::NorIcl => match value {
                Some(icl_ma) => service.apply_nor_icl(icl_ma, election.step).await,
                None => Ok(()),
            },
            Vote::NorFcc => match value {
                Some(fcc_ma) => {
                    let r = service.charger.lock().await.set_fcc(fcc_ma).await;
                    service.bus(r)
                }
                None => Ok(()),
            },
            Vote::NorFv => match value {
                Some(fv_mv) => {
                    let r = service.charger.lock().await.set_fv(fv_mv).await;
                    service.bus(r)
                }
                None => Ok(()),
            },
            Vote::NorOutDisable => {
                let r = service.charger.lock().await.set_charge_enable(!set).await;
                service.bus(r)
            }
            Vote::NorInputDisable => {
                let r = service.charger.lock().await.set_input_suspend(set).await;
                service.bus(r)
            }
            Vote::RxComu => {
                let comu = value.unwrap_or(0).min(u8::MAX as u32) as u8;
                let r = service.rx_ic.lock().await.set_rx_comu(comu).await;
                service.bus(r)
            }
            Vote::InsertDisable => {
                let r = service.rx_ic.lock().await.set_insert_disable(set).await;
                service.bus(r)
            }
        }
    }
}

impl<R: RxController, F: FastChargeController, C: NormalCharger> Service<R, F, C> {
    /// Cast, update or withdraw a vote
    pub async fn vote(&self, which: Vote, voter: Voter, enabled: bool, value: u32, step: bool) {
        let elector = Apply { service: self, which };
        let value = value.min(i32::MAX as u32) as i32;
        if let Err(e) = self.votes.get(which).vote(&elector, voter, enabled, value, step).await {
            error!("{:?}: vote from {:?} rejected: {:?}", which, voter, e);
        }
    }

    /// Recompute a votable and apply its result even if it did not change
    pub async fn rerun_election(&self, which: Vote, step: bool) {
        let elector = Apply { service: self, which };
        self.votes.get(which).rerun_election(&elector, step).await;
    }

    /// Force a votable to a value regardless of votes, `None` releases it
    pub async fn force_vote(&self, which: Vote, value: Option<u32>) {
        let elector = Apply { service: self, which };
        self.votes
            .get(which)
            .force(&elector, value.map(|v| v.min(i32::MAX as u32) as i32))
            .await;
    }

    /// Effective value of a votable
    pub fn effective(&self, which: Vote) -> Option<u32> {
        self.votes.get(which).effective_result().map(|v| v.max(0) as u32)
    }

    /// Value voted by a client, `None` if its vote is not enabled
    pub fn client_vote(&self, which: Vote, voter: Voter) -> Option<u32> {
        self.votes.get(which).client_vote(voter).map(|v| v.max(0) as u32)
    }

    /// Returns true if an enable/disable votable is set
    pub fn is_set(&self, which: Vote) -> bool {
        self.votes.get(which).is_set()
    }

    /// Withdraw every session scoped vote
    ///
    /// The authentication restriction survives while the connection is kept alive.
    pub(crate) async fn clear_session_votes(&self, keep_verity: bool) {
        for which in Vote::ALL {
            for voter in SESSION_VOTERS {
                if self.votes.get(which).is_client_enabled(*voter) {
                    self.vote(which, *voter, false, 0, false).await;
                }
            }
            if !keep_verity && self.votes.get(which).is_client_enabled(Voter::Verity) {
                self.vote(which, Voter::Verity, false, 0, false).await;
            }
        }
    }

    /// Apply the normal charger input current limit
    ///
    /// Decreases are applied at once. Increases are applied in steps when requested so
    /// the transmitter can follow the load.
    pub(crate) async fn apply_nor_icl(&self, icl_ma: u32, step: bool) -> Result<(), Error> {
        let mut state = self.nor.lock().await;
        let current = state.icl_ma.unwrap_or(0);

        if !step || icl_ma <= current || self.config.nor_icl_step_ma == 0 {
            let r = self.charger.lock().await.set_icl(icl_ma).await;
            self.bus(r)?;
            state.icl_ma = Some(icl_ma);
            return Ok(());
        }

        let mut next = current;
        while next < icl_ma {
            if !self.status.online() {
                return Err(Error::Offline);
            }
            next = (next + self.config.nor_icl_step_ma).min(icl_ma);
            trace!("Stepping ICL to {}", next);
            let r = self.charger.lock().await.set_icl(next).await;
            self.bus(r)?;
            state.icl_ma = Some(next);
            if next < icl_ma {
                Timer::after(self.config.nor_icl_step_delay).await;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use embassy_futures::block_on;

    use super::*;
    use crate::test_util::*;

    #[test]
    fn test_fast_curr_min() {
        let hw = Hw::new();
        let service = service(&hw);
        block_on(async {
            service.vote(Vote::FastCurr, Voter::Max, true, 6000, false).await;
            service.vote(Vote::FastCurr, Voter::Step, true, 4000, false).await;
            assert_eq!(service.status.fast.get().target_curr_ma, 4000);
            service.vote(Vote::FastCurr, Voter::Step, false, 0, false).await;
            assert_eq!(service.status.fast.get().target_curr_ma, 6000);
        });
    }

    #[test]
    fn test_disable_votes_reach_hardware() {
        let hw = Hw::new();
        let service = service(&hw);
        block_on(async {
            service.vote(Vote::RxDisable, Voter::User, true, 1, false).await;
            assert!(!hw.rx_enabled.get());
            service.vote(Vote::RxDisable, Voter::User, false, 0, false).await;
            assert!(hw.rx_enabled.get());

            service.vote(Vote::NorOutDisable, Voter::Stop, true, 1, false).await;
            assert!(!hw.charge_enabled.get());
            service.vote(Vote::NorInputDisable, Voter::User, true, 1, false).await;
            assert!(hw.input_suspend.get());
        });
    }

    #[test]
    fn test_icl_steps_up_and_drops_at_once() {
        let hw = Hw::new();
        let service = service(&hw);
        service.status.conn.update(|c| c.online = true);
        block_on(async {
            service.vote(Vote::NorIcl, Voter::Base, true, 300, true).await;
            service.vote(Vote::NorIcl, Voter::Base, true, 100, true).await;
        });
        assert_eq!(*hw.icl_history.borrow(), [100, 200, 300, 100]);
    }

    #[test]
    fn test_bus_error_does_not_roll_back() {
        let hw = Hw::new();
        let service = service(&hw);
        hw.fail_bus.set(true);
        block_on(async {
            service.vote(Vote::NorFcc, Voter::Base, true, 1500, false).await;
        });
        assert_eq!(service.effective(Vote::NorFcc), Some(1500));
        assert_eq!(hw.fcc_ma.get(), 0);
    }

    #[test]
    fn test_session_votes_cleared() {
        let hw = Hw::new();
        let service = service(&hw);
        block_on(async {
            service.vote(Vote::FastCurr, Voter::Verity, true, 1500, false).await;
            service.vote(Vote::FastCurr, Voter::Step, true, 3000, false).await;
            service.vote(Vote::FastCurr, Voter::User, true, 5000, false).await;

            service.clear_session_votes(true).await;
            assert_eq!(service.effective(Vote::FastCurr), Some(1500));

            service.clear_session_votes(false).await;
            assert_eq!(service.effective(Vote::FastCurr), Some(5000));
        });
    }
}
