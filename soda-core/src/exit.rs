use std::fmt;

/// Process exit codes. Each failure site has its own code; the values are
/// dense and stable because the platform reports them verbatim.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum ExitCode {
    Success = 0,
    TermHandlerSigTerm = 1,

    InitEventLoop = 2,
    InitConfig = 3,
    ValidationScopeId = 4,
    BusinessLogicTimeout = 5,

    McuTransportOpen = 6,
    McuTransportClosed = 7,
    McuMessagingTimeout = 8,
    McuMessagingFraming = 9,
    McuMessagingRejected = 10,
    McuMessagingBadResponse = 11,

    CloudInitInvalidScopeId = 12,
    CloudInitClient = 13,
    CloudTelemetryRefused = 14,
    CloudTelemetryAckFailed = 15,

    UpdateInitSubscribe = 16,
    UpdateGetUpdateData = 17,
    UpdateDeferEvent = 18,
    UpdateResumeEvent = 19,
    UpdateUnexpectedStatus = 20,

    MainEventLoopFail = 21,
    PowerRequestFailed = 22,
}

/// Coarse classification of an [`ExitCode`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// Bad command line or configuration. Nothing was started.
    Configuration,
    /// A collaborator could not be set up. No cycle was attempted.
    Initialization,
    /// The MCU or the cloud failed during the cycle.
    Peer,
    /// The update subsystem failed; the cycle still terminates.
    UpdateSubsystem,
    /// The process was asked to stop, or the event loop itself broke.
    Termination,
}

impl ExitCode {
    pub fn is_success(self) -> bool {
        self == ExitCode::Success
    }

    /// `None` for [`ExitCode::Success`].
    pub fn kind(self) -> Option<ErrorKind> {
        use ExitCode::*;

        let kind = match self {
            Success => return None,
            InitConfig | ValidationScopeId | CloudInitInvalidScopeId => ErrorKind::Configuration,
            InitEventLoop | McuTransportOpen | CloudInitClient | UpdateInitSubscribe => {
                ErrorKind::Initialization
            }
            BusinessLogicTimeout
            | McuTransportClosed
            | McuMessagingTimeout
            | McuMessagingFraming
            | McuMessagingRejected
            | McuMessagingBadResponse
            | CloudTelemetryRefused
            | CloudTelemetryAckFailed => ErrorKind::Peer,
            UpdateGetUpdateData | UpdateDeferEvent | UpdateResumeEvent
            | UpdateUnexpectedStatus => ErrorKind::UpdateSubsystem,
            TermHandlerSigTerm | MainEventLoopFail | PowerRequestFailed => {
                ErrorKind::Termination
            }
        };

        Some(kind)
    }
}

impl From<ExitCode> for u8 {
    fn from(code: ExitCode) -> Self {
        code as u8
    }
}

impl From<ExitCode> for std::process::ExitCode {
    fn from(code: ExitCode) -> Self {
        std::process::ExitCode::from(code as u8)
    }
}

impl fmt::Display for ExitCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{self:?} ({})", *self as u8)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn success_has_no_kind() {
        assert_eq!(ExitCode::Success.kind(), None);
        assert_eq!(u8::from(ExitCode::Success), 0);
    }

    #[test]
    fn classification_follows_failure_site() {
        assert_eq!(
            ExitCode::ValidationScopeId.kind(),
            Some(ErrorKind::Configuration)
        );
        assert_eq!(
            ExitCode::McuTransportOpen.kind(),
            Some(ErrorKind::Initialization)
        );
        assert_eq!(ExitCode::McuMessagingTimeout.kind(), Some(ErrorKind::Peer));
        assert_eq!(
            ExitCode::UpdateUnexpectedStatus.kind(),
            Some(ErrorKind::UpdateSubsystem)
        );
        assert_eq!(
            ExitCode::TermHandlerSigTerm.kind(),
            Some(ErrorKind::Termination)
        );
    }

    #[test]
    fn display_includes_numeric_code() {
        assert_eq!(
            ExitCode::McuMessagingTimeout.to_string(),
            "McuMessagingTimeout (8)"
        );
    }
}
