use std::collections::VecDeque;

use log::{debug, error, info, warn};
use mender_api::DeploymentStatus;
use sha2::{Digest, Sha256};
use tokio::sync::mpsc;
use tokio::time::Instant;

use crate::daemon::context::{Context, DeploymentData};
use crate::daemon::states::{resume_state, transition, DeploymentTracking, State, StateEvent};
use crate::error::{ClientError, Result};
use crate::installer;
use crate::inventory;
use crate::scripts::{OnError, ScriptAction, ScriptState};
use crate::store::STATE_DATA_KEY;
use crate::update_module::RebootAction;

/// Signals posted into the machine from the outside world.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExternalEvent {
    PollDeployment,
    SubmitInventory,
    Terminate,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartMode {
    /// Keep polling on the configured intervals until terminated.
    Daemon,
    /// Poll once, run at most one deployment to completion, then stop.
    OneShotPoll,
    /// Submit inventory once, then stop.
    OneShotInventory,
}

/// Drives an artifact through its lifecycle: one state at a time, each
/// `on_enter` run to completion before the next transition, with the
/// persistent record updated ahead of every side-effectful state.
pub struct StateMachine {
    ctx: Context,
    state: State,
    tracking: DeploymentTracking,
    external: mpsc::Receiver<ExternalEvent>,
    pending: VecDeque<StateEvent>,
    terminated: bool,
    one_shot: bool,
    next_poll: Instant,
    next_inventory: Instant,
    last_inventory_digest: Option<[u8; 32]>,
    force_inventory: bool,
}

impl StateMachine {
    pub fn new(ctx: Context, mode: StartMode) -> (Self, mpsc::Sender<ExternalEvent>) {
        let (sender, receiver) = mpsc::channel(16);
        let now = Instant::now();
        let far_future = now + std::time::Duration::from_secs(3600 * 24 * 365);

        let (next_poll, next_inventory) = match mode {
            StartMode::Daemon => (now, now),
            StartMode::OneShotPoll => (now, far_future),
            StartMode::OneShotInventory => (far_future, now),
        };

        let machine = Self {
            ctx,
            state: State::Idle,
            tracking: DeploymentTracking::default(),
            external: receiver,
            pending: VecDeque::new(),
            terminated: false,
            one_shot: mode != StartMode::Daemon,
            next_poll,
            next_inventory,
            last_inventory_digest: None,
            force_inventory: mode == StartMode::OneShotInventory,
        };
        (machine, sender)
    }

    pub fn context(&self) -> &Context {
        &self.ctx
    }

    pub async fn run(&mut self) -> Result<()> {
        if let Some(state_data) = self.ctx.store.load_state_data(STATE_DATA_KEY)? {
            info!(
                "found update in progress in state `{}`, resuming",
                state_data.in_state
            );
            self.state = resume_state(&state_data.in_state);
            self.tracking.failed = state_data.failed;
            if state_data.rolled_back {
                self.tracking.rollback_attempted = true;
            }
            self.ctx.deployment = Some(DeploymentData::resumed(state_data));
        }

        loop {
            self.drain_external();
            if self.terminated {
                info!("termination requested, stopping the update loop");
                break;
            }

            let event = match self.guard_entry()? {
                true => {
                    self.state = State::StateLoop;
                    self.enter(State::StateLoop).await
                }
                false => self.enter(self.state).await,
            };
            debug!("state `{}` produced event {event:?}", self.state);
            self.tracking.observe(self.state, &event);

            if matches!(event, StateEvent::TerminationTriggered) {
                break;
            }

            let next = transition(self.state, &event);
            if next == State::End {
                break;
            }
            if self.one_shot && next == State::Idle && self.state != State::Idle {
                break;
            }
            self.state = next;
        }
        Ok(())
    }

    fn drain_external(&mut self) {
        loop {
            match self.external.try_recv() {
                Ok(ExternalEvent::Terminate) => self.terminated = true,
                Ok(ExternalEvent::PollDeployment) => {
                    self.pending.push_back(StateEvent::DeploymentPollingTriggered);
                }
                Ok(ExternalEvent::SubmitInventory) => {
                    self.force_inventory = true;
                    self.pending.push_back(StateEvent::InventoryPollingTriggered);
                }
                Err(mpsc::error::TryRecvError::Empty) => break,
                Err(mpsc::error::TryRecvError::Disconnected) => break,
            }
        }
    }

    /// The durability rule: persist `in_state` before any side effect of the
    /// state about to be entered. Returns true when the record already names
    /// this state, which means the machine is looping.
    fn guard_entry(&mut self) -> Result<bool> {
        if !self.state.is_side_effectful() {
            return Ok(false);
        }
        let entering = self.state;
        let failed = self.tracking.failed;
        let rolled_back = self.tracking.rolled_back();

        let existing = self.ctx.store.load_state_data(STATE_DATA_KEY)?;
        if existing.as_ref().map(|data| data.in_state.as_str()) == Some(entering.name()) {
            error!("state loop detected while entering `{entering}`");
            return Ok(true);
        }

        let Some(deployment) = &mut self.ctx.deployment else {
            return Ok(false);
        };
        deployment.state_data.in_state = entering.name().to_string();
        deployment.state_data.failed = failed;
        deployment.state_data.rolled_back = rolled_back;

        // Save-provides writes its own combined transaction on entry.
        if entering != State::UpdateSaveProvides {
            self.ctx
                .store
                .save_state_data(STATE_DATA_KEY, &deployment.state_data)?;
        }
        Ok(false)
    }

    async fn enter(&mut self, state: State) -> StateEvent {
        info!("entering state `{state}`");
        match state {
            State::Idle => self.enter_idle().await,
            State::SubmitInventory => self.enter_submit_inventory().await,
            State::PollForDeployment => self.enter_poll_for_deployment().await,
            State::UpdateDownload => self.enter_update_download().await,
            State::UpdateInstall => self.enter_update_install().await,
            State::UpdateCheckReboot => self.enter_update_check_reboot().await,
            State::UpdateReboot => self.enter_update_reboot().await,
            State::UpdateVerifyReboot => self.enter_update_verify_reboot().await,
            State::UpdateCommit => self.enter_update_commit().await,
            State::UpdateAfterCommit => self.enter_update_after_commit().await,
            State::UpdateSaveProvides => self.enter_update_save_provides().await,
            State::UpdateCheckRollback => self.enter_update_check_rollback().await,
            State::UpdateRollback => self.enter_update_rollback().await,
            State::UpdateRollbackReboot => self.enter_update_rollback_reboot().await,
            State::UpdateVerifyRollbackReboot => self.enter_update_verify_rollback_reboot().await,
            State::UpdateFailure => self.enter_update_failure().await,
            State::UpdateCleanup => self.enter_update_cleanup().await,
            State::ClearArtifactData => self.enter_clear_artifact_data().await,
            State::StateLoop => StateEvent::Failure,
            State::End => StateEvent::TerminationTriggered,
        }
    }

    async fn enter_idle(&mut self) -> StateEvent {
        self.ctx.deployment = None;
        self.tracking = DeploymentTracking::default();

        if let Some(event) = self.pending.pop_front() {
            return event;
        }

        tokio::select! {
            external = self.external.recv() => {
                match external {
                    Some(ExternalEvent::PollDeployment) => StateEvent::DeploymentPollingTriggered,
                    Some(ExternalEvent::SubmitInventory) => {
                        self.force_inventory = true;
                        StateEvent::InventoryPollingTriggered
                    }
                    Some(ExternalEvent::Terminate) | None => StateEvent::TerminationTriggered,
                }
            }
            _ = tokio::time::sleep_until(self.next_poll) => {
                self.next_poll = Instant::now() + self.ctx.config.update_poll_interval;
                StateEvent::DeploymentPollingTriggered
            }
            _ = tokio::time::sleep_until(self.next_inventory) => {
                self.next_inventory = Instant::now() + self.ctx.config.inventory_poll_interval;
                StateEvent::InventoryPollingTriggered
            }
        }
    }

    async fn enter_submit_inventory(&mut self) -> StateEvent {
        let attributes = match inventory::collect(&self.ctx.config, &self.ctx.store).await {
            Ok(attributes) => attributes,
            Err(err) => {
                error!("failed to collect inventory: {err}");
                return StateEvent::Failure;
            }
        };

        let digest: [u8; 32] = match serde_json::to_vec(&attributes) {
            Ok(bytes) => Sha256::digest(&bytes).into(),
            Err(err) => {
                error!("failed to serialize inventory: {err}");
                return StateEvent::Failure;
            }
        };
        if !self.force_inventory && self.last_inventory_digest == Some(digest) {
            debug!("inventory unchanged, not resubmitting");
            return StateEvent::NothingToDo;
        }
        self.force_inventory = false;

        let client = reqwest::Client::new();
        match inventory::submit(&client, &self.ctx.auth, &attributes).await {
            Ok(()) => {
                self.last_inventory_digest = Some(digest);
                info!("inventory submitted ({} attributes)", attributes.len());
                StateEvent::Success
            }
            Err(err) => {
                error!("failed to submit inventory: {err}");
                StateEvent::Failure
            }
        }
    }

    async fn enter_poll_for_deployment(&mut self) -> StateEvent {
        if let Err(err) = self
            .ctx
            .scripts
            .run_scripts(ScriptState::Sync, ScriptAction::Enter, OnError::Fail)
            .await
        {
            error!("Sync_Enter scripts failed: {err}");
            return StateEvent::Failure;
        }

        let artifact_name = match self.ctx.store.artifact_name() {
            Ok(name) => name,
            Err(err) => {
                error!("failed to read the installed artifact name: {err}");
                return StateEvent::Failure;
            }
        };

        let result = self
            .ctx
            .deployments
            .check(&self.ctx.device_type, artifact_name.as_deref())
            .await;

        let event = match result {
            Ok(Some(deployment)) => {
                let state_data = crate::store::StateData {
                    version: crate::store::STATE_DATA_VERSION,
                    artifact_name: deployment.artifact.artifact_name.clone(),
                    artifact_group: String::new(),
                    artifact_provides: None,
                    artifact_clears_provides: None,
                    payload_types: Vec::new(),
                    in_state: String::new(),
                    failed: false,
                    rolled_back: false,
                };
                self.ctx.deployment = Some(DeploymentData {
                    id: Some(deployment.id.clone()),
                    state_data,
                    artifact_uri: Some(deployment.artifact.source.uri.clone()),
                    needs_reboot: RebootAction::No,
                    log: None,
                });
                StateEvent::DeploymentStarted
            }
            Ok(None) => {
                debug!("no deployment pending");
                StateEvent::NothingToDo
            }
            Err(err) => {
                error!("failed to poll for a deployment: {err}");
                let _ = self
                    .ctx
                    .scripts
                    .run_scripts(ScriptState::Sync, ScriptAction::Error, OnError::Ignore)
                    .await;
                return StateEvent::Failure;
            }
        };

        if let Err(err) = self
            .ctx
            .scripts
            .run_scripts(ScriptState::Sync, ScriptAction::Leave, OnError::Fail)
            .await
        {
            error!("Sync_Leave scripts failed: {err}");
            return StateEvent::Failure;
        }
        event
    }

    async fn push_status(&mut self, status: DeploymentStatus) {
        let Some(deployment) = &self.ctx.deployment else {
            return;
        };
        let Some(id) = deployment.id.clone() else {
            debug!("resumed deployment has no id, skipping {status} report");
            return;
        };
        if let Err(err) = self.ctx.deployments.push_status(&id, status, None).await {
            error!("failed to push deployment status {status}: {err}");
        }
    }

    async fn push_deployment_logs(&mut self) {
        let Some(deployment) = &self.ctx.deployment else {
            return;
        };
        let (Some(id), Some(log)) = (deployment.id.clone(), &deployment.log) else {
            return;
        };
        let path = log.path().to_path_buf();
        if let Err(err) = self.ctx.deployments.push_logs(&id, &path).await {
            error!("failed to upload the deployment log: {err}");
        }
    }

    async fn enter_update_download(&mut self) -> StateEvent {
        self.push_status(DeploymentStatus::Downloading).await;

        match self.try_download().await {
            Ok(event) => event,
            Err(err) => {
                error!("deployment download failed: {err}");
                self.ctx.log_deployment("error", &err.to_string());
                let _ = self
                    .ctx
                    .scripts
                    .run_scripts(ScriptState::Download, ScriptAction::Error, OnError::Ignore)
                    .await;
                StateEvent::Failure
            }
        }
    }

    async fn try_download(&mut self) -> Result<StateEvent> {
        let (uri, offered_name) = {
            let deployment = self.require_deployment()?;
            (
                deployment.artifact_uri.clone(),
                deployment.state_data.artifact_name.clone(),
            )
        };

        // Quick checks against the deployment instruction before spending
        // bandwidth: the full dependency evaluation runs after the header is
        // parsed.
        if let Ok(Some(current)) = self.ctx.store.artifact_name() {
            if current == offered_name {
                info!("artifact {offered_name} is already installed");
                self.push_status(DeploymentStatus::AlreadyInstalled).await;
                return Ok(StateEvent::NothingToDo);
            }
        }

        let uri = uri.ok_or_else(|| {
            ClientError::State("deployment carries no artifact URI".to_string())
        })?;
        let uri = url::Url::parse(&uri)?;

        self.ctx
            .scripts
            .run_scripts(ScriptState::Download, ScriptAction::Enter, OnError::Fail)
            .await?;

        let token = self.ctx.auth.with_token().await?;
        let artifact_path = self.ctx.artifact_download_path();
        let client = reqwest::Client::new();
        let result = crate::download::download_and_hash(
            &client,
            uri.as_str(),
            &artifact_path,
            Some(&token.token),
            self.ctx.config.retry_poll_interval,
        )
        .await?;
        info!("downloaded {} bytes, sha256 {}", result.size, result.shasum);

        // Parsing, verification and staging are synchronous; keep them off
        // the event loop.
        let config = self.ctx.config.clone();
        let parser_config = self.ctx.config.parser_config()?;
        let device_type = self.ctx.device_type.clone();
        let provides = self.ctx.store.full_provides()?;
        let staged = tokio::task::spawn_blocking(move || {
            installer::stage_artifact(&config, &parser_config, &artifact_path, &device_type, &provides)
        })
        .await
        .map_err(|err| ClientError::Process(format!("staging task failed: {err}")))??;

        if let Some(reason) = staged.incompatible {
            info!("deployment does not apply: {reason}");
            self.ctx.log_deployment("info", &reason);
            self.push_status(DeploymentStatus::AlreadyInstalled).await;
            self.ctx
                .scripts
                .run_scripts(ScriptState::Download, ScriptAction::Leave, OnError::Fail)
                .await?;
            return Ok(StateEvent::NothingToDo);
        }

        {
            let in_state = State::UpdateDownload.name();
            let state_data = installer::state_data_from_artifact(&staged.artifact, in_state);
            let deployment = self.require_deployment()?;
            deployment.state_data = state_data;
        }

        // The module's own Download state runs once the payloads are staged.
        for module in self.ctx.modules() {
            module.download().await?;
        }

        self.ctx
            .scripts
            .run_scripts(ScriptState::Download, ScriptAction::Leave, OnError::Fail)
            .await?;

        Ok(StateEvent::Success)
    }

    fn require_deployment(&mut self) -> Result<&mut DeploymentData> {
        self.ctx
            .deployment
            .as_mut()
            .ok_or_else(|| ClientError::State("no deployment in progress".to_string()))
    }

    async fn query_needs_reboot(&mut self) -> Result<RebootAction> {
        let mut action = RebootAction::No;
        for module in self.ctx.modules() {
            match module.needs_reboot().await? {
                RebootAction::Yes => action = RebootAction::Yes,
                RebootAction::Automatic if action == RebootAction::No => {
                    action = RebootAction::Automatic;
                }
                _ => {}
            }
        }
        if let Some(deployment) = &mut self.ctx.deployment {
            deployment.needs_reboot = action;
        }
        Ok(action)
    }

    async fn enter_update_install(&mut self) -> StateEvent {
        self.push_status(DeploymentStatus::Installing).await;

        let result: Result<StateEvent> = async {
            self.ctx
                .scripts
                .run_scripts(ScriptState::ArtifactInstall, ScriptAction::Enter, OnError::Fail)
                .await?;

            for module in self.ctx.modules() {
                module.artifact_install().await?;
            }

            self.ctx
                .scripts
                .run_scripts(ScriptState::ArtifactInstall, ScriptAction::Leave, OnError::Fail)
                .await?;

            match self.query_needs_reboot().await? {
                RebootAction::No => Ok(StateEvent::Success),
                _ => Ok(StateEvent::RebootNeeded),
            }
        }
        .await;

        match result {
            Ok(event) => event,
            Err(err) => {
                error!("installation failed: {err}");
                self.ctx.log_deployment("error", &err.to_string());
                let _ = self
                    .ctx
                    .scripts
                    .run_scripts(ScriptState::ArtifactInstall, ScriptAction::Error, OnError::Ignore)
                    .await;
                StateEvent::Failure
            }
        }
    }

    async fn enter_update_check_reboot(&mut self) -> StateEvent {
        match self.query_needs_reboot().await {
            Ok(RebootAction::No) => StateEvent::NothingToDo,
            Ok(_) => StateEvent::RebootNeeded,
            Err(err) => {
                error!("failed to query NeedsReboot: {err}");
                self.ctx.log_deployment("error", &err.to_string());
                StateEvent::Failure
            }
        }
    }

    async fn enter_update_reboot(&mut self) -> StateEvent {
        self.push_status(DeploymentStatus::Rebooting).await;

        let result: Result<()> = async {
            self.ctx
                .scripts
                .run_scripts(ScriptState::ArtifactReboot, ScriptAction::Enter, OnError::Fail)
                .await?;

            let needs_reboot = self
                .ctx
                .deployment
                .as_ref()
                .map(|deployment| deployment.needs_reboot)
                .unwrap_or(RebootAction::No);

            for module in self.ctx.modules() {
                match needs_reboot {
                    RebootAction::Yes => module.artifact_reboot().await?,
                    // The client itself is responsible for rebooting the
                    // device; the daemon resumes from the persisted record
                    // afterwards.
                    RebootAction::Automatic => {
                        info!("system reboot requested by the update");
                    }
                    RebootAction::No => {}
                }
            }
            Ok(())
        }
        .await;

        match result {
            Ok(()) => StateEvent::Success,
            Err(err) => {
                error!("reboot failed: {err}");
                self.ctx.log_deployment("error", &err.to_string());
                let _ = self
                    .ctx
                    .scripts
                    .run_scripts(ScriptState::ArtifactReboot, ScriptAction::Error, OnError::Ignore)
                    .await;
                StateEvent::Failure
            }
        }
    }

    async fn enter_update_verify_reboot(&mut self) -> StateEvent {
        let result: Result<()> = async {
            for module in self.ctx.modules() {
                module.artifact_verify_reboot().await?;
            }
            self.ctx
                .scripts
                .run_scripts(ScriptState::ArtifactReboot, ScriptAction::Leave, OnError::Fail)
                .await?;
            Ok(())
        }
        .await;

        match result {
            Ok(()) => StateEvent::Success,
            Err(err) => {
                error!("reboot verification failed: {err}");
                self.ctx.log_deployment("error", &err.to_string());
                let _ = self
                    .ctx
                    .scripts
                    .run_scripts(ScriptState::ArtifactReboot, ScriptAction::Error, OnError::Ignore)
                    .await;
                StateEvent::Failure
            }
        }
    }

    async fn enter_update_commit(&mut self) -> StateEvent {
        self.push_status(DeploymentStatus::PauseBeforeCommitting).await;

        let result: Result<()> = async {
            self.ctx
                .scripts
                .run_scripts(ScriptState::ArtifactCommit, ScriptAction::Enter, OnError::Fail)
                .await?;
            for module in self.ctx.modules() {
                module.artifact_commit().await?;
            }
            Ok(())
        }
        .await;

        match result {
            Ok(()) => StateEvent::Success,
            Err(err) => {
                error!("commit failed: {err}");
                self.ctx.log_deployment("error", &err.to_string());
                let _ = self
                    .ctx
                    .scripts
                    .run_scripts(ScriptState::ArtifactCommit, ScriptAction::Error, OnError::Ignore)
                    .await;
                StateEvent::Failure
            }
        }
    }

    async fn enter_update_after_commit(&mut self) -> StateEvent {
        match self
            .ctx
            .scripts
            .run_scripts(ScriptState::ArtifactCommit, ScriptAction::Leave, OnError::Fail)
            .await
        {
            Ok(()) => StateEvent::Success,
            Err(err) => {
                error!("ArtifactCommit_Leave scripts failed: {err}");
                self.ctx.log_deployment("error", &err.to_string());
                StateEvent::Failure
            }
        }
    }

    async fn enter_update_save_provides(&mut self) -> StateEvent {
        let result: Result<()> = (|| {
            let deployment = self
                .ctx
                .deployment
                .as_ref()
                .ok_or_else(|| ClientError::State("no deployment in progress".to_string()))?;
            self.ctx
                .store
                .commit_artifact_data(STATE_DATA_KEY, &deployment.state_data)?;
            Ok(())
        })();

        match result {
            Ok(()) => {
                self.push_status(DeploymentStatus::Success).await;
                StateEvent::Success
            }
            Err(err) => {
                error!("failed to save the artifact data: {err}");
                self.ctx.log_deployment("error", &err.to_string());
                StateEvent::Failure
            }
        }
    }

    async fn enter_update_check_rollback(&mut self) -> StateEvent {
        let mut supported = false;
        for module in self.ctx.modules() {
            match module.supports_rollback().await {
                Ok(true) => supported = true,
                Ok(false) => {}
                Err(err) => {
                    error!("failed to query SupportsRollback: {err}");
                    self.ctx.log_deployment("error", &err.to_string());
                    return StateEvent::NothingToDo;
                }
            }
        }
        if supported {
            info!("rolling the update back");
            StateEvent::RollbackStarted
        } else {
            info!("update module does not support rollback");
            StateEvent::NothingToDo
        }
    }

    async fn enter_update_rollback(&mut self) -> StateEvent {
        let result: Result<StateEvent> = async {
            self.ctx
                .scripts
                .run_scripts(ScriptState::ArtifactRollback, ScriptAction::Enter, OnError::Fail)
                .await?;
            for module in self.ctx.modules() {
                module.artifact_rollback().await?;
            }
            self.ctx
                .scripts
                .run_scripts(ScriptState::ArtifactRollback, ScriptAction::Leave, OnError::Fail)
                .await?;

            match self.query_needs_reboot().await? {
                RebootAction::No => Ok(StateEvent::Success),
                _ => Ok(StateEvent::RebootNeeded),
            }
        }
        .await;

        match result {
            Ok(event) => event,
            Err(err) => {
                error!("rollback failed: {err}");
                self.ctx.log_deployment("error", &err.to_string());
                let _ = self
                    .ctx
                    .scripts
                    .run_scripts(ScriptState::ArtifactRollback, ScriptAction::Error, OnError::Ignore)
                    .await;
                StateEvent::Failure
            }
        }
    }

    async fn enter_update_rollback_reboot(&mut self) -> StateEvent {
        let result: Result<()> = async {
            self.ctx
                .scripts
                .run_scripts(
                    ScriptState::ArtifactRollbackReboot,
                    ScriptAction::Enter,
                    OnError::Fail,
                )
                .await?;
            for module in self.ctx.modules() {
                module.artifact_rollback_reboot().await?;
            }
            Ok(())
        }
        .await;

        match result {
            Ok(()) => StateEvent::Success,
            Err(err) => {
                error!("rollback reboot failed: {err}");
                self.ctx.log_deployment("error", &err.to_string());
                StateEvent::Failure
            }
        }
    }

    async fn enter_update_verify_rollback_reboot(&mut self) -> StateEvent {
        let result: Result<()> = async {
            for module in self.ctx.modules() {
                module.artifact_verify_rollback_reboot().await?;
            }
            self.ctx
                .scripts
                .run_scripts(
                    ScriptState::ArtifactRollbackReboot,
                    ScriptAction::Leave,
                    OnError::Fail,
                )
                .await?;
            Ok(())
        }
        .await;

        match result {
            Ok(()) => StateEvent::Success,
            Err(err) => {
                error!("rollback reboot verification failed: {err}");
                self.ctx.log_deployment("error", &err.to_string());
                StateEvent::Failure
            }
        }
    }

    async fn enter_update_failure(&mut self) -> StateEvent {
        self.push_status(DeploymentStatus::Failure).await;

        let _ = self
            .ctx
            .scripts
            .run_scripts(ScriptState::ArtifactFailure, ScriptAction::Enter, OnError::Ignore)
            .await;
        for module in self.ctx.modules() {
            if let Err(err) = module.artifact_failure().await {
                error!("ArtifactFailure call failed: {err}");
                self.ctx.log_deployment("error", &err.to_string());
            }
        }
        let _ = self
            .ctx
            .scripts
            .run_scripts(ScriptState::ArtifactFailure, ScriptAction::Leave, OnError::Ignore)
            .await;

        self.push_deployment_logs().await;
        StateEvent::Success
    }

    async fn enter_update_cleanup(&mut self) -> StateEvent {
        for module in self.ctx.modules() {
            if let Err(err) = module.cleanup().await {
                error!("Cleanup call failed: {err}");
            }
        }

        let artifact_path = self.ctx.artifact_download_path();
        if artifact_path.exists() {
            if let Err(err) = std::fs::remove_file(&artifact_path) {
                warn!("failed to remove {}: {err}", artifact_path.display());
            }
        }
        StateEvent::Success
    }

    async fn enter_clear_artifact_data(&mut self) -> StateEvent {
        match self.ctx.store.clear_deployment_data(STATE_DATA_KEY) {
            Ok(()) => StateEvent::Success,
            Err(err) => {
                error!("failed to clear the deployment record: {err}");
                StateEvent::Failure
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::MenderConfig;
    use crate::daemon::states::State;
    use crate::installer::test_artifacts::TestArtifact;
    use crate::store::{MenderStore, StateData, STATE_DATA_VERSION};
    use std::os::unix::fs::PermissionsExt;
    use std::path::Path;
    use wiremock::matchers::{method, path as url_path, path_regex};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    const PRIVKEY_PEM: &str = include_str!("../testdata/private_key_test_pkcs8.pem");

    fn test_config(root: &Path, server_uri: Option<&str>) -> MenderConfig {
        let paths = crate::config::Paths::from_dirs(
            root.join("etc"),
            root.join("share"),
            root.join("datastore"),
        );
        std::fs::create_dir_all(&paths.datastore_dir).unwrap();
        std::fs::write(&paths.device_type_file, "device_type=qemu\n").unwrap();
        std::fs::write(&paths.key_file, PRIVKEY_PEM).unwrap();

        let script = root.join("identity");
        std::fs::write(&script, "#!/bin/sh\necho mac=aa:bb\n").unwrap();
        std::fs::set_permissions(&script, std::fs::Permissions::from_mode(0o755)).unwrap();

        let mut config = MenderConfig::load_from(paths).unwrap();
        if let Some(uri) = server_uri {
            config.servers = vec![uri.trim_end_matches('/').to_string()];
        }
        config.identity_script = script;
        config.auth_timeout = std::time::Duration::from_secs(5);
        config.module_timeout = std::time::Duration::from_secs(10);
        config.script_timeout = std::time::Duration::from_secs(10);
        config
    }

    fn install_module(config: &MenderConfig, name: &str, body: &str) {
        std::fs::create_dir_all(&config.paths.modules_dir).unwrap();
        let path = config.paths.modules_dir.join(name);
        std::fs::write(&path, format!("#!/bin/sh\n{body}\n")).unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
    }

    async fn mount_server_basics(server: &MockServer, artifact: &[u8]) {
        Mock::given(method("POST"))
            .and(url_path(mender_api::auth::AUTH_REQUESTS_PATH))
            .respond_with(ResponseTemplate::new(200).set_body_string("JWT-TOKEN"))
            .mount(server)
            .await;
        Mock::given(method("GET"))
            .and(url_path("/artifact.mender"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(artifact.to_vec()))
            .mount(server)
            .await;
        Mock::given(method("PUT"))
            .and(path_regex(r"^/api/devices/v1/deployments/device/deployments/.*/status$"))
            .respond_with(ResponseTemplate::new(204))
            .mount(server)
            .await;
        Mock::given(method("PUT"))
            .and(path_regex(r"^/api/devices/v1/deployments/device/deployments/.*/log$"))
            .respond_with(ResponseTemplate::new(204))
            .mount(server)
            .await;
    }

    async fn mount_deployment(server: &MockServer, artifact_name: &str) {
        let body = serde_json::json!({
            "id": "deployment-1",
            "artifact": {
                "artifact_name": artifact_name,
                "source": {"uri": format!("{}/artifact.mender", server.uri())},
                "device_types_compatible": ["qemu"],
            }
        });
        Mock::given(method("GET"))
            .and(url_path(mender_api::deployments::DEPLOYMENTS_NEXT_PATH))
            .respond_with(ResponseTemplate::new(200).set_body_json(body))
            .mount(server)
            .await;
    }

    async fn received_statuses(server: &MockServer) -> Vec<String> {
        server
            .received_requests()
            .await
            .unwrap()
            .iter()
            .filter(|request| request.url.path().ends_with("/status"))
            .map(|request| {
                let body: serde_json::Value = serde_json::from_slice(&request.body).unwrap();
                body["status"].as_str().unwrap().to_string()
            })
            .collect()
    }

    fn module_calls(log: &Path) -> Vec<String> {
        std::fs::read_to_string(log)
            .map(|content| content.lines().map(str::to_string).collect())
            .unwrap_or_default()
    }

    #[tokio::test]
    async fn test_deployment_happy_path() {
        let server = MockServer::start().await;
        let artifact = TestArtifact::new("release-2", "qemu").build();
        mount_server_basics(&server, &artifact).await;
        mount_deployment(&server, "release-2").await;

        let tmp = tempfile::tempdir().unwrap();
        let config = test_config(tmp.path(), Some(&server.uri()));
        let calls = tmp.path().join("calls.log");
        install_module(&config, "dummy", &format!(r#"echo "$1" >> {}"#, calls.display()));

        let ctx = Context::with_store(config, MenderStore::in_memory()).unwrap();
        let (mut machine, _events) = StateMachine::new(ctx, StartMode::OneShotPoll);
        machine.run().await.unwrap();

        assert_eq!(
            module_calls(&calls),
            vec![
                "Download",
                "ArtifactInstall",
                "NeedsReboot",
                "ArtifactCommit",
                "Cleanup"
            ]
        );

        let store = &machine.context().store;
        assert_eq!(store.artifact_name().unwrap().as_deref(), Some("release-2"));
        assert!(store.load_state_data(crate::store::STATE_DATA_KEY).unwrap().is_none());

        assert_eq!(
            received_statuses(&server).await,
            vec!["downloading", "installing", "pause_before_committing", "success"]
        );
    }

    #[tokio::test]
    async fn test_deployment_with_reboot_continues_after_module_returns() {
        let server = MockServer::start().await;
        let artifact = TestArtifact::new("release-2", "qemu").build();
        mount_server_basics(&server, &artifact).await;
        mount_deployment(&server, "release-2").await;

        let tmp = tempfile::tempdir().unwrap();
        let config = test_config(tmp.path(), Some(&server.uri()));
        let calls = tmp.path().join("calls.log");
        install_module(
            &config,
            "dummy",
            &format!(
                r#"echo "$1" >> {log}
if [ "$1" = "NeedsReboot" ]; then echo "Yes"; fi"#,
                log = calls.display()
            ),
        );

        let ctx = Context::with_store(config, MenderStore::in_memory()).unwrap();
        let (mut machine, _events) = StateMachine::new(ctx, StartMode::OneShotPoll);
        machine.run().await.unwrap();

        let called = module_calls(&calls);
        assert!(called.contains(&"ArtifactReboot".to_string()));
        assert!(called.contains(&"ArtifactVerifyReboot".to_string()));
        assert!(called.contains(&"ArtifactCommit".to_string()));

        let statuses = received_statuses(&server).await;
        assert!(statuses.contains(&"rebooting".to_string()));
        assert_eq!(statuses.last().map(String::as_str), Some("success"));
    }

    #[tokio::test]
    async fn test_failed_install_rolls_back() {
        let server = MockServer::start().await;
        let artifact = TestArtifact::new("release-2", "qemu").build();
        mount_server_basics(&server, &artifact).await;
        mount_deployment(&server, "release-2").await;

        let tmp = tempfile::tempdir().unwrap();
        let config = test_config(tmp.path(), Some(&server.uri()));
        let calls = tmp.path().join("calls.log");
        install_module(
            &config,
            "dummy",
            &format!(
                r#"echo "$1" >> {log}
case "$1" in
    ArtifactInstall) exit 1 ;;
    SupportsRollback) echo "Yes" ;;
esac"#,
                log = calls.display()
            ),
        );

        let ctx = Context::with_store(config, MenderStore::in_memory()).unwrap();
        let (mut machine, _events) = StateMachine::new(ctx, StartMode::OneShotPoll);
        machine.run().await.unwrap();

        let called = module_calls(&calls);
        assert!(called.contains(&"ArtifactRollback".to_string()));
        assert!(called.contains(&"ArtifactFailure".to_string()));
        assert!(called.contains(&"Cleanup".to_string()));
        assert!(!called.contains(&"ArtifactCommit".to_string()));

        let store = &machine.context().store;
        assert!(store.artifact_name().unwrap().is_none());
        assert!(store.load_state_data(crate::store::STATE_DATA_KEY).unwrap().is_none());

        let statuses = received_statuses(&server).await;
        assert_eq!(statuses.last().map(String::as_str), Some("failure"));

        // The deployment log was uploaded with the failure wrapped inside.
        let log_uploads: Vec<_> = server
            .received_requests()
            .await
            .unwrap()
            .into_iter()
            .filter(|request| request.url.path().ends_with("/log"))
            .collect();
        assert_eq!(log_uploads.len(), 1);
        let bundle: serde_json::Value = serde_json::from_slice(&log_uploads[0].body).unwrap();
        assert!(!bundle["messages"].as_array().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_offered_artifact_already_installed() {
        let server = MockServer::start().await;
        mount_server_basics(&server, b"unused").await;
        mount_deployment(&server, "release-1").await;

        let tmp = tempfile::tempdir().unwrap();
        let config = test_config(tmp.path(), Some(&server.uri()));
        let calls = tmp.path().join("calls.log");
        install_module(&config, "dummy", &format!(r#"echo "$1" >> {}"#, calls.display()));

        let store = MenderStore::in_memory();
        store
            .raw()
            .write(crate::store::ARTIFACT_NAME_KEY, b"release-1")
            .unwrap();

        let ctx = Context::with_store(config, store).unwrap();
        let (mut machine, _events) = StateMachine::new(ctx, StartMode::OneShotPoll);
        machine.run().await.unwrap();

        assert!(module_calls(&calls).is_empty());
        let statuses = received_statuses(&server).await;
        assert_eq!(statuses, vec!["downloading", "already-installed"]);
    }

    fn resumable_state_data(in_state: &str) -> StateData {
        StateData {
            version: STATE_DATA_VERSION,
            artifact_name: "release-2".to_string(),
            artifact_group: String::new(),
            artifact_provides: None,
            artifact_clears_provides: None,
            payload_types: vec!["dummy".to_string()],
            in_state: in_state.to_string(),
            failed: false,
            rolled_back: false,
        }
    }

    #[tokio::test]
    async fn test_resume_after_reboot_commits() {
        let tmp = tempfile::tempdir().unwrap();
        let config = test_config(tmp.path(), None);
        let calls = tmp.path().join("calls.log");
        install_module(&config, "dummy", &format!(r#"echo "$1" >> {}"#, calls.display()));

        // The work directory of the interrupted deployment is still there.
        let work_dir = crate::installer::work_dir_for(&config, 0);
        std::fs::create_dir_all(work_dir.join("files")).unwrap();

        let store = MenderStore::in_memory();
        store
            .save_state_data(crate::store::STATE_DATA_KEY, &resumable_state_data("update-reboot"))
            .unwrap();

        let ctx = Context::with_store(config, store).unwrap();
        let (mut machine, _events) = StateMachine::new(ctx, StartMode::OneShotPoll);
        machine.run().await.unwrap();

        assert_eq!(
            module_calls(&calls),
            vec!["ArtifactVerifyReboot", "ArtifactCommit", "Cleanup"]
        );
        let store = &machine.context().store;
        assert_eq!(store.artifact_name().unwrap().as_deref(), Some("release-2"));
        assert!(store.load_state_data(crate::store::STATE_DATA_KEY).unwrap().is_none());
    }

    #[tokio::test]
    async fn test_resume_interrupted_install_rolls_back() {
        let tmp = tempfile::tempdir().unwrap();
        let config = test_config(tmp.path(), None);
        let calls = tmp.path().join("calls.log");
        install_module(
            &config,
            "dummy",
            &format!(
                r#"echo "$1" >> {log}
if [ "$1" = "SupportsRollback" ]; then echo "Yes"; fi"#,
                log = calls.display()
            ),
        );
        let work_dir = crate::installer::work_dir_for(&config, 0);
        std::fs::create_dir_all(work_dir.join("files")).unwrap();

        let store = MenderStore::in_memory();
        store
            .save_state_data(crate::store::STATE_DATA_KEY, &resumable_state_data("update-install"))
            .unwrap();

        let ctx = Context::with_store(config, store).unwrap();
        let (mut machine, _events) = StateMachine::new(ctx, StartMode::OneShotPoll);
        machine.run().await.unwrap();

        let called = module_calls(&calls);
        assert!(called.contains(&"ArtifactRollback".to_string()));
        assert!(called.contains(&"ArtifactFailure".to_string()));

        let store = &machine.context().store;
        assert!(store.artifact_name().unwrap().is_none());
        assert!(store.load_state_data(crate::store::STATE_DATA_KEY).unwrap().is_none());
    }

    #[tokio::test]
    async fn test_repeated_resume_into_same_state_is_a_loop() {
        let tmp = tempfile::tempdir().unwrap();
        let config = test_config(tmp.path(), None);
        let calls = tmp.path().join("calls.log");
        install_module(&config, "dummy", &format!(r#"echo "$1" >> {}"#, calls.display()));
        let work_dir = crate::installer::work_dir_for(&config, 0);
        std::fs::create_dir_all(work_dir.join("files")).unwrap();

        // Cleanup resumes into cleanup; entering a state whose name equals
        // the persisted in_state is the loop signal.
        let store = MenderStore::in_memory();
        store
            .save_state_data(crate::store::STATE_DATA_KEY, &resumable_state_data("update-cleanup"))
            .unwrap();

        let ctx = Context::with_store(config, store).unwrap();
        let (mut machine, _events) = StateMachine::new(ctx, StartMode::OneShotPoll);
        machine.run().await.unwrap();

        let called = module_calls(&calls);
        assert!(called.contains(&"ArtifactFailure".to_string()));
        assert!(called.contains(&"Cleanup".to_string()));
        assert!(machine
            .context()
            .store
            .load_state_data(crate::store::STATE_DATA_KEY)
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn test_terminate_stops_the_loop() {
        let tmp = tempfile::tempdir().unwrap();
        let config = test_config(tmp.path(), None);

        let ctx = Context::with_store(config, MenderStore::in_memory()).unwrap();
        let (mut machine, events) = StateMachine::new(ctx, StartMode::Daemon);

        let runner = tokio::spawn(async move { machine.run().await });
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        events.send(ExternalEvent::Terminate).await.unwrap();

        tokio::time::timeout(std::time::Duration::from_secs(5), runner)
            .await
            .expect("machine did not stop on terminate")
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn test_state_names_are_stable() {
        // Persisted records depend on these names.
        assert_eq!(State::UpdateInstall.name(), "update-install");
        assert_eq!(State::UpdateReboot.name(), "update-reboot");
        assert_eq!(State::UpdateCommit.name(), "update-commit");
        assert_eq!(State::UpdateSaveProvides.name(), "update-save-provides");
        assert_eq!(State::UpdateRollback.name(), "update-rollback");
        assert_eq!(State::UpdateRollbackReboot.name(), "update-rollback-reboot");
        assert_eq!(State::UpdateFailure.name(), "update-failure");
        assert_eq!(State::UpdateCleanup.name(), "update-cleanup");
    }
}
