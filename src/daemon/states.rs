/// Main states of the updater. Terminal work states are reached through the
/// cleanup tail; `End` only through termination.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    Idle,
    SubmitInventory,
    PollForDeployment,
    UpdateDownload,
    UpdateInstall,
    UpdateCheckReboot,
    UpdateReboot,
    UpdateVerifyReboot,
    UpdateCommit,
    UpdateAfterCommit,
    UpdateSaveProvides,
    UpdateCheckRollback,
    UpdateRollback,
    UpdateRollbackReboot,
    UpdateVerifyRollbackReboot,
    UpdateFailure,
    UpdateCleanup,
    ClearArtifactData,
    StateLoop,
    End,
}

impl State {
    /// The name persisted as `in_state` and compared on resume.
    pub fn name(&self) -> &'static str {
        match self {
            State::Idle => "idle",
            State::SubmitInventory => "submit-inventory",
            State::PollForDeployment => "poll-for-deployment",
            State::UpdateDownload => "update-download",
            State::UpdateInstall => "update-install",
            State::UpdateCheckReboot => "update-check-reboot",
            State::UpdateReboot => "update-reboot",
            State::UpdateVerifyReboot => "update-verify-reboot",
            State::UpdateCommit => "update-commit",
            State::UpdateAfterCommit => "update-after-commit",
            State::UpdateSaveProvides => "update-save-provides",
            State::UpdateCheckRollback => "update-check-rollback",
            State::UpdateRollback => "update-rollback",
            State::UpdateRollbackReboot => "update-rollback-reboot",
            State::UpdateVerifyRollbackReboot => "update-verify-rollback-reboot",
            State::UpdateFailure => "update-failure",
            State::UpdateCleanup => "update-cleanup",
            State::ClearArtifactData => "clear-artifact-data",
            State::StateLoop => "state-loop",
            State::End => "end",
        }
    }

    /// States that change persistent side effects; the record is updated
    /// with `in_state` before any of their work runs.
    pub fn is_side_effectful(&self) -> bool {
        matches!(
            self,
            State::UpdateInstall
                | State::UpdateReboot
                | State::UpdateCommit
                | State::UpdateSaveProvides
                | State::UpdateRollback
                | State::UpdateRollbackReboot
                | State::UpdateFailure
                | State::UpdateCleanup
        )
    }
}

impl std::fmt::Display for State {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StateEvent {
    Success,
    Failure,
    NothingToDo,
    RebootNeeded,
    RollbackStarted,
    DeploymentStarted,
    DeploymentPollingTriggered,
    InventoryPollingTriggered,
    TerminationTriggered,
}

/// Where to pick up after a restart, from the persisted `in_state`. Every
/// continuation differs from the saved state itself; re-entering the same
/// state is what the loop detection catches.
pub fn resume_state(in_state: &str) -> State {
    match in_state {
        // The process died mid-install or mid-commit: not safe to repeat,
        // try to roll back.
        "update-install" | "update-commit" => State::UpdateCheckRollback,
        // Reboots are expected to take the process down.
        "update-reboot" => State::UpdateVerifyReboot,
        "update-rollback-reboot" => State::UpdateVerifyRollbackReboot,
        // The provides were committed in the same transaction as this
        // state name, so only cleanup is left.
        "update-save-provides" => State::UpdateCleanup,
        "update-rollback" => State::UpdateFailure,
        "update-failure" => State::UpdateCleanup,
        "update-cleanup" => State::UpdateCleanup,
        // A record from a different client generation: reconcile through
        // the failure tail.
        _ => State::UpdateFailure,
    }
}

/// Total transition function of the state graph.
pub fn transition(state: State, event: &StateEvent) -> State {
    use State::*;
    use StateEvent::*;

    if matches!(event, TerminationTriggered) {
        return End;
    }

    match (state, event) {
        (Idle, DeploymentPollingTriggered) => PollForDeployment,
        (Idle, InventoryPollingTriggered) => SubmitInventory,
        (Idle, _) => Idle,

        (SubmitInventory, _) => Idle,

        (PollForDeployment, DeploymentStarted) => UpdateDownload,
        (PollForDeployment, _) => Idle,

        (UpdateDownload, Success) => UpdateInstall,
        (UpdateDownload, NothingToDo) => UpdateCleanup,
        (UpdateDownload, _) => UpdateCheckRollback,

        (UpdateInstall, Success) => UpdateCommit,
        (UpdateInstall, RebootNeeded) => UpdateCheckReboot,
        (UpdateInstall, _) => UpdateCheckRollback,

        (UpdateCheckReboot, RebootNeeded) => UpdateReboot,
        (UpdateCheckReboot, Success | NothingToDo) => UpdateCommit,
        (UpdateCheckReboot, _) => UpdateCheckRollback,

        (UpdateReboot, Success) => UpdateVerifyReboot,
        (UpdateReboot, _) => UpdateCheckRollback,

        (UpdateVerifyReboot, Success) => UpdateCommit,
        (UpdateVerifyReboot, _) => UpdateCheckRollback,

        (UpdateCommit, Success) => UpdateAfterCommit,
        (UpdateCommit, _) => UpdateCheckRollback,

        // The module has committed; failures from here on are reported but
        // cannot be rolled back.
        (UpdateAfterCommit, Success) => UpdateSaveProvides,
        (UpdateAfterCommit, _) => UpdateFailure,

        (UpdateSaveProvides, _) => UpdateCleanup,

        (UpdateCheckRollback, RollbackStarted) => UpdateRollback,
        (UpdateCheckRollback, _) => UpdateFailure,

        (UpdateRollback, RebootNeeded) => UpdateRollbackReboot,
        (UpdateRollback, _) => UpdateFailure,

        (UpdateRollbackReboot, _) => UpdateVerifyRollbackReboot,
        (UpdateVerifyRollbackReboot, _) => UpdateFailure,

        (UpdateFailure, _) => UpdateCleanup,
        (UpdateCleanup, _) => ClearArtifactData,
        (ClearArtifactData, _) => Idle,

        (StateLoop, _) => UpdateFailure,

        (End, _) => End,
    }
}

/// Parallel bookkeeping of the current deployment's outcome, fed from the
/// events the runner observes so individual states do not have to remember
/// to update it.
#[derive(Debug, Clone, Copy, Default)]
pub struct DeploymentTracking {
    pub failed: bool,
    pub rollback_attempted: bool,
    pub rollback_failed: bool,
}

impl DeploymentTracking {
    pub fn observe(&mut self, state: State, event: &StateEvent) {
        use State::*;
        use StateEvent::*;

        match (state, event) {
            (
                UpdateDownload | UpdateInstall | UpdateCheckReboot | UpdateReboot
                | UpdateVerifyReboot | UpdateCommit | UpdateAfterCommit,
                Failure,
            ) => self.failed = true,
            (StateLoop, _) => self.failed = true,
            (UpdateCheckRollback, RollbackStarted) => self.rollback_attempted = true,
            (
                UpdateRollback | UpdateRollbackReboot | UpdateVerifyRollbackReboot,
                Failure,
            ) => self.rollback_failed = true,
            _ => {}
        }
    }

    /// Whether the device ended up back on the previous software.
    pub fn rolled_back(&self) -> bool {
        self.rollback_attempted && !self.rollback_failed
    }
}
