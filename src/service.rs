//! Execution contexts and the per-service legality table.

use core::fmt;

/// Where a kernel service is being called from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Context {
    /// Task level, on behalf of the running task.
    Task,
    /// An interrupt handler (category 2 ISR).
    Isr,
}

/// Every kernel service, used for the context check and for error reports.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Service {
    ActivateTask,
    TerminateTask,
    ChainTask,
    Schedule,
    GetTaskId,
    GetTaskState,
    SetEvent,
    ClearEvent,
    GetEvent,
    WaitEvent,
    GetResource,
    ReleaseResource,
    GetAlarmBase,
    GetAlarm,
    SetRelAlarm,
    SetAbsAlarm,
    CancelAlarm,
    IncrementCounter,
    GetCounterValue,
    GetElapsedValue,
    ShutdownOs,
}

impl Service {
    /// Whether the service may be called from `ctx`.
    pub const fn allowed_in(self, ctx: Context) -> bool {
        match ctx {
            Context::Task => true,
            Context::Isr => !matches!(
                self,
                Service::TerminateTask
                    | Service::ChainTask
                    | Service::Schedule
                    | Service::ClearEvent
                    | Service::WaitEvent
                    | Service::GetResource
                    | Service::ReleaseResource
            ),
        }
    }

    pub const fn name(self) -> &'static str {
        match self {
            Service::ActivateTask => "ActivateTask",
            Service::TerminateTask => "TerminateTask",
            Service::ChainTask => "ChainTask",
            Service::Schedule => "Schedule",
            Service::GetTaskId => "GetTaskID",
            Service::GetTaskState => "GetTaskState",
            Service::SetEvent => "SetEvent",
            Service::ClearEvent => "ClearEvent",
            Service::GetEvent => "GetEvent",
            Service::WaitEvent => "WaitEvent",
            Service::GetResource => "GetResource",
            Service::ReleaseResource => "ReleaseResource",
            Service::GetAlarmBase => "GetAlarmBase",
            Service::GetAlarm => "GetAlarm",
            Service::SetRelAlarm => "SetRelAlarm",
            Service::SetAbsAlarm => "SetAbsAlarm",
            Service::CancelAlarm => "CancelAlarm",
            Service::IncrementCounter => "IncrementCounter",
            Service::GetCounterValue => "GetCounterValue",
            Service::GetElapsedValue => "GetElapsedValue",
            Service::ShutdownOs => "ShutdownOS",
        }
    }
}

impl fmt::Display for Service {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_task_context_allows_everything() {
        for s in [Service::WaitEvent, Service::GetResource, Service::ShutdownOs] {
            assert!(s.allowed_in(Context::Task));
        }
    }

    #[test]
    fn test_isr_context_table() {
        let allowed = [
            Service::ActivateTask,
            Service::GetTaskId,
            Service::GetTaskState,
            Service::SetEvent,
            Service::GetEvent,
            Service::GetAlarmBase,
            Service::GetAlarm,
            Service::SetRelAlarm,
            Service::SetAbsAlarm,
            Service::CancelAlarm,
            Service::IncrementCounter,
            Service::GetCounterValue,
            Service::GetElapsedValue,
            Service::ShutdownOs,
        ];
        let denied = [
            Service::TerminateTask,
            Service::ChainTask,
            Service::Schedule,
            Service::ClearEvent,
            Service::WaitEvent,
            Service::GetResource,
            Service::ReleaseResource,
        ];
        assert!(allowed.iter().all(|s| s.allowed_in(Context::Isr)));
        assert!(denied.iter().all(|s| !s.allowed_in(Context::Isr)));
    }

    #[test]
    fn test_display_uses_osek_names() {
        assert_eq!(std::format!("{}", Service::GetTaskId), "GetTaskID");
        assert_eq!(std::format!("{}", Service::ShutdownOs), "ShutdownOS");
    }
}
