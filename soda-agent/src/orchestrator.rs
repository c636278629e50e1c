//! The wake-to-sleep cycle as a pure state machine.
//!
//! The orchestrator never performs I/O. The reactor feeds it [`Event`]s and
//! carries out the [`Action`]s it returns. After each event it advances
//! through as many states as it can, stopping in a waiting or terminal state.

use std::time::Duration;

use soda_core::{
    CloudTelemetry, Color, DeviceTelemetry, ExitCode,
    protocol::{McuRequest, McuResponse},
};
use soda_link::{Completion, McuFailure};
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::cloud::{CloudEvent, FlavorUpdate};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CycleState {
    Initializing,
    WaitForMcu,
    WaitForCloud,
    GatherTelemetry,
    WaitForTelemetry,
    SendTelemetry,
    WaitForTelemetryAck,
    PersistTelemetry,
    WaitForFlavor,
    WaitForUpdate,
    TimedOut,
    WaitForUpdatesAfterTimeout,
    Reboot,
    Sleep,
    Success,
    Failure,
}

impl CycleState {
    /// States that belong to the business part of the cycle.
    fn is_business(self) -> bool {
        matches!(
            self,
            CycleState::Initializing
                | CycleState::WaitForMcu
                | CycleState::WaitForCloud
                | CycleState::GatherTelemetry
                | CycleState::WaitForTelemetry
                | CycleState::SendTelemetry
                | CycleState::WaitForTelemetryAck
                | CycleState::PersistTelemetry
                | CycleState::WaitForFlavor
        )
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, CycleState::Success | CycleState::Failure)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Event {
    Mcu(Completion),
    Cloud(CloudEvent),
    /// The gateway would not accept telemetry.
    TelemetryRefused,
    /// The gateway would not accept the flavor acknowledgement.
    FlavorAckRefused,
    UpdateCheckComplete { reboot_required: bool },
    UpdateCheckFailed(ExitCode),
    /// The global cycle deadline passed.
    DeadlineElapsed,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Action {
    NotifyStarting,
    McuRequest(McuRequest),
    SendTelemetry(CloudTelemetry),
    SendFlavorAck {
        name: Option<String>,
        color: Option<Color>,
    },
    Persist(DeviceTelemetry),
    /// The business part of the cycle is over; pending updates may install.
    BusinessLogicComplete,
    NotifyFinished,
    Reboot,
    Powerdown(Duration),
}

#[derive(Debug, Clone, PartialEq)]
enum FlavorStep {
    Idle,
    ApplyingColor { name: Option<String>, requested: Color },
    Acknowledging,
    Done,
}

#[derive(Debug)]
pub struct Orchestrator {
    state: CycleState,
    timeout: Duration,
    residency: Duration,
    deadline: Option<Instant>,
    exit_code: ExitCode,
    previous: Option<DeviceTelemetry>,

    mcu_ready: bool,
    cloud_connected: bool,
    telemetry: Option<DeviceTelemetry>,
    telemetry_acked: bool,
    pending_flavor: Option<FlavorUpdate>,
    flavor: FlavorStep,
    business_over: bool,
    /// Set once the update check is over; holds "reboot required".
    update: Option<bool>,
}

impl Orchestrator {
    /// `previous` is the telemetry persisted by the last successful cycle.
    pub fn new(timeout: Duration, residency: Duration, previous: Option<DeviceTelemetry>) -> Self {
        Self {
            state: CycleState::Initializing,
            timeout,
            residency,
            deadline: None,
            exit_code: ExitCode::Success,
            previous,
            mcu_ready: false,
            cloud_connected: false,
            telemetry: None,
            telemetry_acked: false,
            pending_flavor: None,
            flavor: FlavorStep::Idle,
            business_over: false,
            update: None,
        }
    }

    pub fn state(&self) -> CycleState {
        self.state
    }

    pub fn exit_code(&self) -> ExitCode {
        self.exit_code
    }

    pub fn is_finished(&self) -> bool {
        self.state.is_terminal()
    }

    /// When the global deadline fires, while armed.
    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// Keep `code` unless an earlier failure was already recorded.
    pub fn record_fatal(&mut self, code: ExitCode) {
        if code.is_success() {
            return;
        }
        if self.exit_code.is_success() {
            self.exit_code = code;
            if self.state == CycleState::Success {
                self.state = CycleState::Failure;
            }
        } else {
            debug!(kept = %self.exit_code, ignored = %code, "Exit code already recorded");
        }
    }

    pub fn start(&mut self, now: Instant) -> Vec<Action> {
        let mut out = Vec::new();
        if self.state != CycleState::Initializing {
            warn!(state = ?self.state, "Cycle already started");
            return out;
        }

        self.deadline = Some(now + self.timeout);
        out.push(Action::NotifyStarting);
        out.push(Action::McuRequest(McuRequest::Init));
        self.transition(CycleState::WaitForMcu);

        self.advance(&mut out);
        out
    }

    pub fn handle(&mut self, event: Event) -> Vec<Action> {
        let mut out = Vec::new();

        match event {
            Event::Mcu(completion) => self.on_mcu(completion, &mut out),
            Event::Cloud(event) => self.on_cloud(event, &mut out),
            Event::TelemetryRefused => {
                error!("Cloud refused telemetry");
                self.fail(ExitCode::CloudTelemetryRefused, &mut out);
            }
            Event::FlavorAckRefused => self.on_flavor_ack(false, &mut out),
            Event::UpdateCheckComplete { reboot_required } => {
                info!(reboot_required, "Update check complete");
                self.update = Some(reboot_required);
            }
            Event::UpdateCheckFailed(code) => {
                error!(%code, "Update check failed");
                self.record_fatal(code);
                self.update = Some(false);
            }
            Event::DeadlineElapsed => self.on_deadline(&mut out),
        }

        self.advance(&mut out);
        out
    }

    fn on_mcu(&mut self, completion: Completion, out: &mut Vec<Action>) {
        let response = match completion.outcome {
            Ok(response) => response,
            Err(failure) => {
                error!(request = ?completion.request, ?failure, "MCU request failed");
                self.fail(failure_code(&failure), out);
                return;
            }
        };

        match response {
            McuResponse::Init { protocol_version } => {
                info!(?protocol_version, "MCU initialized");
                self.mcu_ready = true;
            }
            McuResponse::Telemetry(telemetry) => {
                info!(
                    lifetime_total_dispenses = telemetry.lifetime_total_dispenses,
                    lifetime_total_stocked_dispenses = telemetry.lifetime_total_stocked_dispenses,
                    capacity = telemetry.capacity,
                    battery_level = telemetry.battery_level,
                    "Telemetry received from MCU"
                );
                if let Some(previous) = self
                    .previous
                    .as_ref()
                    .filter(|previous| regressed(previous, &telemetry))
                {
                    error!(
                        previous_dispenses = previous.lifetime_total_dispenses,
                        previous_stocked = previous.lifetime_total_stocked_dispenses,
                        "Lifetime counters went backwards, discarding reading"
                    );
                    self.fail(ExitCode::McuMessagingBadResponse, out);
                    return;
                }
                self.telemetry = Some(telemetry);
            }
            McuResponse::SetLed(applied) => {
                let step = std::mem::replace(&mut self.flavor, FlavorStep::Acknowledging);
                match step {
                    FlavorStep::ApplyingColor { name, requested } => {
                        if applied != requested {
                            warn!(%requested, %applied, "MCU applied a different color");
                        }
                        info!(color = %applied, "LED color applied, acknowledging flavor");
                        out.push(Action::SendFlavorAck {
                            name,
                            color: Some(applied),
                        });
                    }
                    other => {
                        warn!(color = %applied, "Unexpected SetLed response");
                        self.flavor = other;
                    }
                }
            }
        }
    }

    fn on_cloud(&mut self, event: CloudEvent, out: &mut Vec<Action>) {
        match event {
            CloudEvent::Connection(connected) => self.cloud_connected = connected,
            CloudEvent::Flavor(update) => {
                if self.flavor == FlavorStep::Idle {
                    self.pending_flavor = Some(update);
                } else {
                    info!(?update, "Flavor already handled this cycle, ignoring");
                }
            }
            CloudEvent::TelemetryAck(true) => {
                info!("Telemetry received by cloud");
                self.telemetry_acked = true;
            }
            CloudEvent::TelemetryAck(false) => {
                error!("Cloud failed to deliver telemetry");
                self.fail(ExitCode::CloudTelemetryAckFailed, out);
            }
            CloudEvent::FlavorAck(success) => self.on_flavor_ack(success, out),
        }
    }

    fn on_flavor_ack(&mut self, success: bool, out: &mut Vec<Action>) {
        if self.flavor != FlavorStep::Acknowledging {
            warn!(success, "Unexpected flavor acknowledgement");
            return;
        }

        if success {
            info!("Flavor acknowledged by cloud");
            self.flavor = FlavorStep::Done;
            return;
        }

        // Ends the business part without marking the process as failed.
        error!("Cloud failed to record flavor acknowledgement");
        if self.state.is_business() {
            self.transition(CycleState::WaitForUpdate);
            self.end_business(out);
        }
    }

    fn on_deadline(&mut self, out: &mut Vec<Action>) {
        if self.deadline.take().is_none() || self.business_over || self.state.is_terminal() {
            return;
        }
        if matches!(self.state, CycleState::Reboot | CycleState::Sleep) {
            return;
        }

        error!(state = ?self.state, "Timed out before business logic could complete");
        self.record_fatal(ExitCode::BusinessLogicTimeout);
        self.transition(CycleState::TimedOut);
        self.end_business(out);
    }

    /// Store `code` and skip to the update wait.
    fn fail(&mut self, code: ExitCode, out: &mut Vec<Action>) {
        if !self.state.is_business() {
            warn!(%code, state = ?self.state, "Ignoring failure after business logic ended");
            return;
        }

        self.record_fatal(code);
        self.transition(CycleState::WaitForUpdate);
        self.end_business(out);
    }

    fn end_business(&mut self, out: &mut Vec<Action>) {
        // The global deadline only bounds the business logic.
        self.deadline = None;
        if !self.business_over {
            self.business_over = true;
            out.push(Action::BusinessLogicComplete);
        }
    }

    fn transition(&mut self, next: CycleState) {
        debug!(from = ?self.state, to = ?next, "State transition");
        self.state = next;
    }

    fn advance(&mut self, out: &mut Vec<Action>) {
        while let Some(next) = self.step(out) {
            self.transition(next);
        }
    }

    /// Run the current state once. `None` means wait for the next event.
    fn step(&mut self, out: &mut Vec<Action>) -> Option<CycleState> {
        match self.state {
            CycleState::Initializing => None,
            CycleState::WaitForMcu => self.mcu_ready.then_some(CycleState::WaitForCloud),
            CycleState::WaitForCloud => self
                .cloud_connected
                .then_some(CycleState::GatherTelemetry),
            CycleState::GatherTelemetry => {
                out.push(Action::McuRequest(McuRequest::RequestTelemetry));
                Some(CycleState::WaitForTelemetry)
            }
            CycleState::WaitForTelemetry => {
                self.telemetry.map(|_| CycleState::SendTelemetry)
            }
            CycleState::SendTelemetry => {
                let telemetry = self.telemetry?;
                let cloud = telemetry.to_cloud(self.previous.as_ref());
                info!(
                    dispenses_since_last_sync = cloud.dispenses_since_last_sync,
                    remaining_dispenses = cloud.remaining_dispenses,
                    low_soda = cloud.low_soda,
                    "Sending telemetry"
                );
                out.push(Action::SendTelemetry(cloud));
                Some(CycleState::WaitForTelemetryAck)
            }
            CycleState::WaitForTelemetryAck => self
                .telemetry_acked
                .then_some(CycleState::PersistTelemetry),
            CycleState::PersistTelemetry => {
                let telemetry = self.telemetry?;
                out.push(Action::Persist(telemetry));
                Some(CycleState::WaitForFlavor)
            }
            CycleState::WaitForFlavor => self.step_flavor(out),
            CycleState::WaitForUpdate | CycleState::WaitForUpdatesAfterTimeout => {
                self.update.map(terminal_for)
            }
            CycleState::TimedOut => match self.update {
                Some(reboot_required) => Some(terminal_for(reboot_required)),
                None => {
                    info!("Waiting for update check to complete after timeout");
                    Some(CycleState::WaitForUpdatesAfterTimeout)
                }
            },
            CycleState::Reboot => {
                info!("Requesting device reboot");
                out.push(Action::NotifyFinished);
                out.push(Action::Reboot);
                Some(self.outcome())
            }
            CycleState::Sleep => {
                info!(
                    residency_secs = self.residency.as_secs(),
                    "Requesting device power-down"
                );
                out.push(Action::NotifyFinished);
                out.push(Action::Powerdown(self.residency));
                Some(self.outcome())
            }
            CycleState::Success | CycleState::Failure => None,
        }
    }

    fn step_flavor(&mut self, out: &mut Vec<Action>) -> Option<CycleState> {
        if self.flavor == FlavorStep::Idle {
            match self.pending_flavor.take()? {
                FlavorUpdate::NoChange => self.flavor = FlavorStep::Done,
                FlavorUpdate::Change {
                    name,
                    color: Some(color),
                } => {
                    info!(%color, ?name, "Sending SetLed");
                    out.push(Action::McuRequest(McuRequest::SetLed(color)));
                    self.flavor = FlavorStep::ApplyingColor {
                        name,
                        requested: color,
                    };
                }
                FlavorUpdate::Change { name, color: None } => {
                    info!(?name, "No color change, acknowledging flavor");
                    out.push(Action::SendFlavorAck { name, color: None });
                    self.flavor = FlavorStep::Acknowledging;
                }
            }
        }

        if self.flavor != FlavorStep::Done {
            return None;
        }

        self.end_business(out);
        Some(CycleState::WaitForUpdate)
    }

    fn outcome(&self) -> CycleState {
        if self.exit_code.is_success() {
            CycleState::Success
        } else {
            CycleState::Failure
        }
    }
}

/// Persisted lifetime counters only ever grow.
fn regressed(previous: &DeviceTelemetry, current: &DeviceTelemetry) -> bool {
    current.lifetime_total_dispenses < previous.lifetime_total_dispenses
        || current.lifetime_total_stocked_dispenses < previous.lifetime_total_stocked_dispenses
}

fn terminal_for(reboot_required: bool) -> CycleState {
    if reboot_required {
        CycleState::Reboot
    } else {
        CycleState::Sleep
    }
}

pub fn failure_code(failure: &McuFailure) -> ExitCode {
    match failure {
        McuFailure::TimedOut => ExitCode::McuMessagingTimeout,
        McuFailure::Framing(_) => ExitCode::McuMessagingFraming,
        McuFailure::Rejected(_) => ExitCode::McuMessagingRejected,
        McuFailure::Mismatch { .. } | McuFailure::BadResponse(_) => {
            ExitCode::McuMessagingBadResponse
        }
        McuFailure::Closed => ExitCode::McuTransportClosed,
    }
}

#[cfg(test)]
mod tests {
    use soda_core::protocol::RequestId;

    use super::*;

    const TIMEOUT: Duration = Duration::from_secs(120);
    const RESIDENCY: Duration = Duration::from_secs(60);

    fn telemetry(dispenses: u32) -> DeviceTelemetry {
        DeviceTelemetry {
            lifetime_total_dispenses: dispenses,
            lifetime_total_stocked_dispenses: 100,
            capacity: 100,
            battery_level: 4.05,
        }
    }

    fn ok(request: RequestId, response: McuResponse) -> Event {
        Event::Mcu(Completion {
            request,
            outcome: Ok(response),
        })
    }

    fn failed(request: RequestId, failure: McuFailure) -> Event {
        Event::Mcu(Completion {
            request,
            outcome: Err(failure),
        })
    }

    fn init_ok() -> Event {
        ok(
            RequestId::Init,
            McuResponse::Init {
                protocol_version: Some(2),
            },
        )
    }

    /// Drive a fresh cycle up to the flavor wait.
    fn to_flavor_wait(orchestrator: &mut Orchestrator, reading: DeviceTelemetry) {
        orchestrator.start(Instant::now());
        orchestrator.handle(init_ok());
        orchestrator.handle(Event::Cloud(CloudEvent::Connection(true)));
        orchestrator.handle(ok(RequestId::RequestTelemetry, McuResponse::Telemetry(reading)));
        let actions = orchestrator.handle(Event::Cloud(CloudEvent::TelemetryAck(true)));
        assert_eq!(actions, vec![Action::Persist(reading)]);
        assert_eq!(orchestrator.state(), CycleState::WaitForFlavor);
    }

    #[test]
    fn happy_path_with_color_change() {
        let mut o = Orchestrator::new(TIMEOUT, RESIDENCY, None);

        let actions = o.start(Instant::now());
        assert_eq!(
            actions,
            vec![Action::NotifyStarting, Action::McuRequest(McuRequest::Init)]
        );
        assert!(o.deadline().is_some());

        // Twin arrives before the cycle gets to it and is held.
        assert!(o.handle(Event::Cloud(CloudEvent::Connection(true))).is_empty());
        assert!(
            o.handle(Event::Cloud(CloudEvent::Flavor(FlavorUpdate::Change {
                name: Some("cola".into()),
                color: Some(Color::RED),
            })))
            .is_empty()
        );

        assert_eq!(
            o.handle(init_ok()),
            vec![Action::McuRequest(McuRequest::RequestTelemetry)]
        );

        let actions = o.handle(ok(
            RequestId::RequestTelemetry,
            McuResponse::Telemetry(telemetry(10)),
        ));
        assert_eq!(
            actions,
            vec![Action::SendTelemetry(telemetry(10).to_cloud(None))]
        );

        let actions = o.handle(Event::Cloud(CloudEvent::TelemetryAck(true)));
        assert_eq!(
            actions,
            vec![
                Action::Persist(telemetry(10)),
                Action::McuRequest(McuRequest::SetLed(Color::RED)),
            ]
        );

        let actions = o.handle(ok(RequestId::SetLed, McuResponse::SetLed(Color::RED)));
        assert_eq!(
            actions,
            vec![Action::SendFlavorAck {
                name: Some("cola".into()),
                color: Some(Color::RED)
            }]
        );

        let actions = o.handle(Event::Cloud(CloudEvent::FlavorAck(true)));
        assert_eq!(actions, vec![Action::BusinessLogicComplete]);
        assert_eq!(o.state(), CycleState::WaitForUpdate);
        assert_eq!(o.deadline(), None);

        let actions = o.handle(Event::UpdateCheckComplete {
            reboot_required: false,
        });
        assert_eq!(
            actions,
            vec![Action::NotifyFinished, Action::Powerdown(RESIDENCY)]
        );
        assert_eq!(o.state(), CycleState::Success);
        assert_eq!(o.exit_code(), ExitCode::Success);
    }

    #[test]
    fn name_only_flavor_skips_the_led() {
        let mut o = Orchestrator::new(TIMEOUT, RESIDENCY, None);
        o.handle(Event::Cloud(CloudEvent::Flavor(FlavorUpdate::Change {
            name: Some("lemonade".into()),
            color: None,
        })));
        o.start(Instant::now());
        o.handle(init_ok());
        o.handle(Event::Cloud(CloudEvent::Connection(true)));
        o.handle(ok(
            RequestId::RequestTelemetry,
            McuResponse::Telemetry(telemetry(3)),
        ));

        let actions = o.handle(Event::Cloud(CloudEvent::TelemetryAck(true)));
        assert_eq!(
            actions,
            vec![
                Action::Persist(telemetry(3)),
                Action::SendFlavorAck {
                    name: Some("lemonade".into()),
                    color: None
                },
            ]
        );

        assert_eq!(
            o.handle(Event::Cloud(CloudEvent::FlavorAck(true))),
            vec![Action::BusinessLogicComplete]
        );
    }

    #[test]
    fn no_change_twin_completes_the_flavor_step() {
        let mut o = Orchestrator::new(TIMEOUT, RESIDENCY, Some(telemetry(8)));
        to_flavor_wait(&mut o, telemetry(10));

        let actions = o.handle(Event::Cloud(CloudEvent::Flavor(FlavorUpdate::NoChange)));
        assert_eq!(actions, vec![Action::BusinessLogicComplete]);
        assert_eq!(o.state(), CycleState::WaitForUpdate);
    }

    #[test]
    fn update_result_waits_for_business_logic() {
        let mut o = Orchestrator::new(TIMEOUT, RESIDENCY, None);
        o.start(Instant::now());
        assert!(
            o.handle(Event::UpdateCheckComplete {
                reboot_required: true
            })
            .is_empty()
        );
        assert_eq!(o.state(), CycleState::WaitForMcu);

        o.handle(init_ok());
        o.handle(Event::Cloud(CloudEvent::Connection(true)));
        o.handle(ok(
            RequestId::RequestTelemetry,
            McuResponse::Telemetry(telemetry(1)),
        ));
        o.handle(Event::Cloud(CloudEvent::TelemetryAck(true)));

        let actions = o.handle(Event::Cloud(CloudEvent::Flavor(FlavorUpdate::NoChange)));
        assert_eq!(
            actions,
            vec![
                Action::BusinessLogicComplete,
                Action::NotifyFinished,
                Action::Reboot
            ]
        );
        assert_eq!(o.state(), CycleState::Success);
    }

    #[test]
    fn mcu_timeout_skips_to_update_wait() {
        let mut o = Orchestrator::new(TIMEOUT, RESIDENCY, None);
        o.start(Instant::now());
        o.handle(init_ok());
        o.handle(Event::Cloud(CloudEvent::Connection(true)));

        let actions = o.handle(failed(RequestId::RequestTelemetry, McuFailure::TimedOut));
        assert_eq!(actions, vec![Action::BusinessLogicComplete]);
        assert_eq!(o.state(), CycleState::WaitForUpdate);
        assert_eq!(o.exit_code(), ExitCode::McuMessagingTimeout);

        // Later failures do not replace the first code.
        o.record_fatal(ExitCode::TermHandlerSigTerm);
        assert_eq!(o.exit_code(), ExitCode::McuMessagingTimeout);

        let actions = o.handle(Event::UpdateCheckComplete {
            reboot_required: false,
        });
        assert_eq!(
            actions,
            vec![Action::NotifyFinished, Action::Powerdown(RESIDENCY)]
        );
        assert_eq!(o.state(), CycleState::Failure);
    }

    #[test]
    fn telemetry_ack_failure_is_fatal_for_the_cycle() {
        let mut o = Orchestrator::new(TIMEOUT, RESIDENCY, None);
        o.start(Instant::now());
        o.handle(init_ok());
        o.handle(Event::Cloud(CloudEvent::Connection(true)));
        o.handle(ok(
            RequestId::RequestTelemetry,
            McuResponse::Telemetry(telemetry(5)),
        ));

        let actions = o.handle(Event::Cloud(CloudEvent::TelemetryAck(false)));
        assert!(!actions.iter().any(|a| matches!(a, Action::Persist(_))));
        assert_eq!(o.exit_code(), ExitCode::CloudTelemetryAckFailed);
        assert_eq!(o.state(), CycleState::WaitForUpdate);
    }

    #[test]
    fn flavor_ack_failure_does_not_fail_the_process() {
        let mut o = Orchestrator::new(TIMEOUT, RESIDENCY, None);
        to_flavor_wait(&mut o, telemetry(10));
        o.handle(Event::Cloud(CloudEvent::Flavor(FlavorUpdate::Change {
            name: Some("cola".into()),
            color: None,
        })));

        let actions = o.handle(Event::Cloud(CloudEvent::FlavorAck(false)));
        assert_eq!(actions, vec![Action::BusinessLogicComplete]);
        assert_eq!(o.state(), CycleState::WaitForUpdate);
        assert_eq!(o.exit_code(), ExitCode::Success);
    }

    #[test]
    fn deadline_after_flavor_ack_failure_is_ignored() {
        let mut o = Orchestrator::new(TIMEOUT, RESIDENCY, None);
        to_flavor_wait(&mut o, telemetry(10));
        o.handle(Event::Cloud(CloudEvent::Flavor(FlavorUpdate::Change {
            name: Some("cola".into()),
            color: None,
        })));
        o.handle(Event::Cloud(CloudEvent::FlavorAck(false)));
        assert_eq!(o.deadline(), None);

        // A download still running when the cycle deadline would have
        // passed.
        assert!(o.handle(Event::DeadlineElapsed).is_empty());
        assert_eq!(o.state(), CycleState::WaitForUpdate);

        let actions = o.handle(Event::UpdateCheckComplete {
            reboot_required: false,
        });
        assert_eq!(
            actions,
            vec![Action::NotifyFinished, Action::Powerdown(RESIDENCY)]
        );
        assert_eq!(o.state(), CycleState::Success);
        assert_eq!(o.exit_code(), ExitCode::Success);
    }

    #[test]
    fn mcu_failure_disarms_the_deadline() {
        let mut o = Orchestrator::new(TIMEOUT, RESIDENCY, None);
        o.start(Instant::now());
        o.handle(failed(RequestId::Init, McuFailure::TimedOut));
        assert_eq!(o.deadline(), None);

        assert!(o.handle(Event::DeadlineElapsed).is_empty());
        assert_eq!(o.exit_code(), ExitCode::McuMessagingTimeout);
    }

    #[test]
    fn regressed_counters_are_not_sent_or_persisted() {
        let previous = DeviceTelemetry {
            lifetime_total_dispenses: 50,
            lifetime_total_stocked_dispenses: 100,
            capacity: 100,
            battery_level: 4.0,
        };
        let reset = DeviceTelemetry {
            lifetime_total_dispenses: 5,
            lifetime_total_stocked_dispenses: 2,
            ..previous
        };

        let mut o = Orchestrator::new(TIMEOUT, RESIDENCY, Some(previous));
        o.start(Instant::now());
        o.handle(init_ok());
        o.handle(Event::Cloud(CloudEvent::Connection(true)));

        let actions = o.handle(ok(RequestId::RequestTelemetry, McuResponse::Telemetry(reset)));
        assert_eq!(actions, vec![Action::BusinessLogicComplete]);
        assert_eq!(o.exit_code(), ExitCode::McuMessagingBadResponse);
        assert_eq!(o.state(), CycleState::WaitForUpdate);

        // A stocked count that only grew is fine even if dispenses match.
        let mut o = Orchestrator::new(TIMEOUT, RESIDENCY, Some(previous));
        let restocked = DeviceTelemetry {
            lifetime_total_stocked_dispenses: 200,
            ..previous
        };
        to_flavor_wait(&mut o, restocked);
        assert_eq!(o.exit_code(), ExitCode::Success);
    }

    #[test]
    fn deadline_waits_for_update_check() {
        let mut o = Orchestrator::new(TIMEOUT, RESIDENCY, None);
        o.start(Instant::now());
        o.handle(init_ok());

        let actions = o.handle(Event::DeadlineElapsed);
        assert_eq!(actions, vec![Action::BusinessLogicComplete]);
        assert_eq!(o.state(), CycleState::WaitForUpdatesAfterTimeout);
        assert_eq!(o.exit_code(), ExitCode::BusinessLogicTimeout);
        assert_eq!(o.deadline(), None);

        // A late cloud connection no longer resumes the business logic.
        assert!(o.handle(Event::Cloud(CloudEvent::Connection(true))).is_empty());

        let actions = o.handle(Event::UpdateCheckComplete {
            reboot_required: false,
        });
        assert_eq!(
            actions,
            vec![Action::NotifyFinished, Action::Powerdown(RESIDENCY)]
        );
        assert_eq!(o.state(), CycleState::Failure);
    }

    #[test]
    fn deadline_after_update_check_goes_straight_to_terminal() {
        let mut o = Orchestrator::new(TIMEOUT, RESIDENCY, None);
        o.start(Instant::now());
        o.handle(Event::UpdateCheckComplete {
            reboot_required: true,
        });

        let actions = o.handle(Event::DeadlineElapsed);
        assert_eq!(
            actions,
            vec![
                Action::BusinessLogicComplete,
                Action::NotifyFinished,
                Action::Reboot
            ]
        );
    }

    #[test]
    fn update_failure_completes_the_check() {
        let mut o = Orchestrator::new(TIMEOUT, RESIDENCY, None);
        to_flavor_wait(&mut o, telemetry(10));
        o.handle(Event::UpdateCheckFailed(ExitCode::UpdateUnexpectedStatus));

        let actions = o.handle(Event::Cloud(CloudEvent::Flavor(FlavorUpdate::NoChange)));
        assert_eq!(
            actions,
            vec![
                Action::BusinessLogicComplete,
                Action::NotifyFinished,
                Action::Powerdown(RESIDENCY)
            ]
        );
        assert_eq!(o.exit_code(), ExitCode::UpdateUnexpectedStatus);
    }

    #[test]
    fn mcu_failures_map_to_distinct_codes() {
        assert_eq!(
            failure_code(&McuFailure::Rejected(3)),
            ExitCode::McuMessagingRejected
        );
        assert_eq!(failure_code(&McuFailure::Closed), ExitCode::McuTransportClosed);
        assert_eq!(
            failure_code(&McuFailure::Framing(
                soda_core::protocol::ProtocolError::InvalidLength(0)
            )),
            ExitCode::McuMessagingFraming
        );
    }
}
