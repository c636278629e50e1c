//! The single-threaded reactor that runs one cycle.

use std::collections::VecDeque;
use std::time::Duration;

use soda_core::ExitCode;
use soda_link::{CancellationToken, Completion, LinkError, McuFailure, McuLink, MessengerError};
use tokio::{
    io::{AsyncRead, AsyncWrite},
    time::Instant,
};
use tracing::{error, info, instrument, warn};

use crate::cloud::{ClientEvent, CloudClient, CloudGateway};
use crate::config::{Config, ScopeId};
use crate::orchestrator::{Action, Event, Orchestrator};
use crate::platform::UpdatePlatform;
use crate::power::PowerController;
use crate::status::StatusIndicator;
use crate::store::TelemetryStore;
use crate::update::{GuardOutput, UpdateEvent, UpdateGuard};

/// Timing for one cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CycleSettings {
    pub timeout: Duration,
    pub residency: Duration,
    pub check_timeout: Duration,
    pub download_timeout: Duration,
}

impl Default for CycleSettings {
    fn default() -> Self {
        Self::from(&Config::default())
    }
}

impl From<&Config> for CycleSettings {
    fn from(config: &Config) -> Self {
        Self {
            timeout: config.cycle.timeout(),
            residency: config.cycle.residency(),
            check_timeout: config.updates.check_timeout(),
            download_timeout: config.updates.download_timeout(),
        }
    }
}

/// Leaf services the cycle drives.
pub struct Collaborators {
    pub store: Box<dyn TelemetryStore>,
    pub power: Box<dyn PowerController>,
    pub status: Box<dyn StatusIndicator>,
    pub updates: Box<dyn UpdatePlatform>,
}

enum Input {
    Link(Result<Completion, LinkError>),
    LinkDeadline,
    Cloud(Option<ClientEvent>),
    Update(Option<UpdateEvent>),
    CycleDeadline,
    GuardDeadline,
    Terminate,
}

pub struct Agent<C, S> {
    scope_id: ScopeId,
    settings: CycleSettings,
    gateway: CloudGateway<C>,
    link: McuLink<S>,
    link_open: bool,
    services: Collaborators,
    cancel: CancellationToken,
}

impl<C, S> Agent<C, S>
where
    C: CloudClient,
    S: AsyncRead + AsyncWrite + Unpin,
{
    pub fn new(
        scope_id: ScopeId,
        settings: CycleSettings,
        client: C,
        link: McuLink<S>,
        services: Collaborators,
    ) -> Self {
        Self {
            scope_id,
            settings,
            gateway: CloudGateway::new(client),
            link,
            link_open: true,
            services,
            cancel: CancellationToken::new(),
        }
    }

    /// Run one cycle to its terminal request and return the exit code.
    #[instrument(name = "cycle", skip_all, fields(scope_id = %self.scope_id))]
    pub async fn run(mut self) -> ExitCode {
        let code = self.run_cycle().await;
        self.cancel.cancel();

        if code.is_success() {
            info!("Cycle completed successfully");
        } else {
            error!(%code, kind = ?code.kind(), "Cycle finished with error");
        }
        code
    }

    async fn run_cycle(&mut self) -> ExitCode {
        let previous = match self.services.store.retrieve().await {
            Ok(previous) => previous,
            Err(e) => {
                warn!(error = %e, "Failed to read persistent storage");
                None
            }
        };

        let mut cloud_rx = match self
            .gateway
            .connect(&self.scope_id, self.cancel.clone())
            .await
        {
            Ok(rx) => rx,
            Err(e) => {
                error!(error = %e, "Failed to initialize cloud client");
                return self.abandon(ExitCode::CloudInitClient).await;
            }
        };

        let mut update_rx = match self.services.updates.subscribe(self.cancel.clone()).await {
            Ok(rx) => rx,
            Err(e) => {
                error!(error = %e, "Failed to register for update notifications");
                return self.abandon(ExitCode::UpdateInitSubscribe).await;
            }
        };

        let mut shutdown = match Shutdown::install() {
            Ok(shutdown) => shutdown,
            Err(e) => {
                error!(error = %e, "Failed to register termination handler");
                return self.abandon(ExitCode::InitEventLoop).await;
            }
        };

        let mut orchestrator =
            Orchestrator::new(self.settings.timeout, self.settings.residency, previous);
        let mut guard = UpdateGuard::new(self.settings.check_timeout, self.settings.download_timeout);

        let now = Instant::now();
        guard.start(now);
        let actions = orchestrator.start(now);
        self.drive(&mut orchestrator, &mut guard, actions, Vec::new())
            .await;

        let mut cloud_open = true;
        let mut updates_open = true;

        while !orchestrator.is_finished() {
            let link_deadline = self.link.deadline();
            let cycle_deadline = orchestrator.deadline();
            let guard_deadline = guard.deadline();

            // Polled in order so simultaneous deadlines resolve the same way
            // every run, update guard first.
            let input = tokio::select! {
                biased;
                _ = shutdown.recv() => Input::Terminate,
                completion = self.link.recv(), if self.link_open => Input::Link(completion),
                _ = sleep_until(link_deadline) => Input::LinkDeadline,
                event = cloud_rx.recv(), if cloud_open => Input::Cloud(event),
                event = update_rx.recv(), if updates_open => Input::Update(event),
                _ = sleep_until(guard_deadline) => Input::GuardDeadline,
                _ = sleep_until(cycle_deadline) => Input::CycleDeadline,
            };

            let mut events = Vec::new();
            match input {
                Input::Link(Ok(completion)) => events.push(Event::Mcu(completion)),
                Input::Link(Err(e)) => {
                    error!(error = %e, "MCU transport failed");
                    self.link_open = false;
                    events.extend(self.link.abort().map(Event::Mcu));
                }
                Input::LinkDeadline => {
                    events.extend(self.link.expire(Instant::now()).map(Event::Mcu));
                }
                Input::Cloud(Some(event)) => {
                    events.extend(self.gateway.handle(event).await.map(Event::Cloud));
                }
                Input::Cloud(None) => {
                    warn!("Cloud client stopped delivering events");
                    cloud_open = false;
                }
                Input::Update(Some(event)) => {
                    let output = guard.on_event(event, Instant::now());
                    events.extend(self.apply_guard(&mut guard, output).await);
                }
                Input::Update(None) => {
                    warn!("Update notifications stopped");
                    updates_open = false;
                }
                Input::CycleDeadline => events.push(Event::DeadlineElapsed),
                Input::GuardDeadline => {
                    let output = guard.on_deadline(Instant::now());
                    events.extend(self.apply_guard(&mut guard, output).await);
                }
                Input::Terminate => {
                    warn!("Termination requested");
                    orchestrator.record_fatal(ExitCode::TermHandlerSigTerm);
                    self.services.status.notify_finished().await;
                    break;
                }
            }

            self.drive(&mut orchestrator, &mut guard, Vec::new(), events)
                .await;
        }

        orchestrator.exit_code()
    }

    /// Give up before the cycle started.
    async fn abandon(&mut self, code: ExitCode) -> ExitCode {
        self.services.status.notify_finished().await;
        code
    }

    /// Carry out actions and feed their synchronous outcomes back until
    /// nothing is left to do.
    async fn drive(
        &mut self,
        orchestrator: &mut Orchestrator,
        guard: &mut UpdateGuard,
        actions: Vec<Action>,
        events: Vec<Event>,
    ) {
        let mut actions = VecDeque::from(actions);
        let mut events = VecDeque::from(events);

        loop {
            if let Some(action) = actions.pop_front() {
                if let Some(event) = self.perform(action, orchestrator, guard).await {
                    events.push_back(event);
                }
            } else if let Some(event) = events.pop_front() {
                actions.extend(orchestrator.handle(event));
            } else {
                break;
            }
        }
    }

    async fn perform(
        &mut self,
        action: Action,
        orchestrator: &mut Orchestrator,
        guard: &mut UpdateGuard,
    ) -> Option<Event> {
        match action {
            Action::NotifyStarting => self.services.status.notify_starting().await,
            Action::McuRequest(request) => {
                if !self.link_open {
                    return Some(closed(request.id()));
                }
                if let Err(e) = self.link.request(request).await {
                    error!(error = %e, ?request, "Failed to send MCU request");
                    let failure = match e {
                        LinkError::Messenger(MessengerError::Encode(e)) => McuFailure::Framing(e),
                        LinkError::Io(_) | LinkError::Closed => {
                            self.link_open = false;
                            McuFailure::Closed
                        }
                        LinkError::Messenger(MessengerError::Busy { .. }) => McuFailure::Closed,
                    };
                    return Some(Event::Mcu(Completion {
                        request: request.id(),
                        outcome: Err(failure),
                    }));
                }
            }
            Action::SendTelemetry(telemetry) => {
                if let Err(e) = self.gateway.send_telemetry(&telemetry).await {
                    warn!(error = %e, "Telemetry not sent");
                    return Some(Event::TelemetryRefused);
                }
            }
            Action::SendFlavorAck { name, color } => {
                if let Err(e) = self.gateway.send_flavor_ack(name.as_deref(), color).await {
                    warn!(error = %e, "Flavor acknowledgement not sent");
                    return Some(Event::FlavorAckRefused);
                }
            }
            Action::Persist(telemetry) => {
                if let Err(e) = self.services.store.persist(&telemetry).await {
                    error!(error = %e, "Failed to persist telemetry");
                }
            }
            Action::BusinessLogicComplete => guard.on_business_logic_complete(),
            Action::NotifyFinished => self.services.status.notify_finished().await,
            Action::Reboot => {
                if let Err(e) = self.services.power.request_reboot().await {
                    error!(error = %e, "Reboot request failed");
                    orchestrator.record_fatal(ExitCode::PowerRequestFailed);
                }
            }
            Action::Powerdown(residency) => {
                if let Err(e) = self.services.power.request_powerdown(residency).await {
                    error!(error = %e, "Power-down request failed");
                    orchestrator.record_fatal(ExitCode::PowerRequestFailed);
                }
            }
        }
        None
    }

    /// Act on the guard's request, returning what the orchestrator should
    /// hear about it.
    async fn apply_guard(
        &mut self,
        guard: &mut UpdateGuard,
        output: Option<GuardOutput>,
    ) -> Option<Event> {
        let mut output = output;

        while let Some(next) = output.take() {
            match next {
                GuardOutput::Defer(duration) => {
                    if let Err(e) = self.services.updates.defer(duration).await {
                        error!(error = %e, "Failed to defer update");
                        output = guard.on_platform_error(ExitCode::UpdateDeferEvent);
                    }
                }
                GuardOutput::Resume => {
                    if let Err(e) = self.services.updates.resume().await {
                        error!(error = %e, "Failed to resume update");
                        output = guard.on_platform_error(ExitCode::UpdateResumeEvent);
                    }
                }
                GuardOutput::CheckComplete { reboot_required } => {
                    return Some(Event::UpdateCheckComplete { reboot_required });
                }
                GuardOutput::Failed(code) => return Some(Event::UpdateCheckFailed(code)),
            }
        }

        None
    }
}

fn closed(request: soda_core::protocol::RequestId) -> Event {
    Event::Mcu(Completion {
        request,
        outcome: Err(McuFailure::Closed),
    })
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

/// Termination signals: SIGTERM, plus Ctrl-C for development.
struct Shutdown {
    #[cfg(unix)]
    term: tokio::signal::unix::Signal,
}

impl Shutdown {
    fn install() -> std::io::Result<Self> {
        Ok(Self {
            #[cfg(unix)]
            term: tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())?,
        })
    }

    async fn recv(&mut self) {
        let interrupt = async {
            if tokio::signal::ctrl_c().await.is_err() {
                std::future::pending::<()>().await;
            }
        };

        #[cfg(unix)]
        {
            let term = async {
                if self.term.recv().await.is_none() {
                    std::future::pending::<()>().await;
                }
            };
            tokio::select! {
                _ = term => {}
                _ = interrupt => {}
            }
        }

        #[cfg(not(unix))]
        interrupt.await;
    }
}
