use crate::abi::ContractHandle;
use crate::signer::SignerResolver;
use pc_api_types::CallResult;
use pc_node_client::{ContractCall, DryRunResult, render_value};
use serde_json::Value;
use std::sync::{Arc, Mutex, PoisonError, Weak};
use tracing::{debug, error, info, warn};

/// Receives every status a call goes through, terminal one included.
pub trait StatusSink: Send + Sync {
    fn report(&self, result: &CallResult);
}

/// Forwards to a collaborator only while it is still alive.
pub struct WeakSink<T: StatusSink> {
    owner: Weak<T>,
}

impl<T: StatusSink> WeakSink<T> {
    pub fn new(owner: &Arc<T>) -> Self {
        Self {
            owner: Arc::downgrade(owner),
        }
    }
}

impl<T: StatusSink> StatusSink for WeakSink<T> {
    fn report(&self, result: &CallResult) {
        match self.owner.upgrade() {
            Some(owner) => owner.report(result),
            None => debug!(payload = %result.payload, "discarding status for dropped collaborator"),
        }
    }
}

/// Per-call status holder with the full history of reports.
#[derive(Debug, Default)]
pub struct CallStatusCell {
    history: Mutex<Vec<CallResult>>,
}

impl CallStatusCell {
    pub fn latest(&self) -> Option<CallResult> {
        self.history
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .last()
            .cloned()
    }

    pub fn history(&self) -> Vec<CallResult> {
        self.history
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

impl StatusSink for CallStatusCell {
    fn report(&self, result: &CallResult) {
        self.history
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(result.clone());
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Invocation {
    /// Identifier or camelCase name of the message.
    pub method: String,
    pub caller: String,
    pub is_transaction: bool,
    pub params: Vec<Value>,
}

pub struct CallOrchestrator {
    signers: Arc<SignerResolver>,
}

impl CallOrchestrator {
    pub fn new(signers: Arc<SignerResolver>) -> Self {
        Self { signers }
    }

    /// Always settles: the returned result is terminal and was also the last
    /// report made to `sink`.
    pub async fn invoke(
        &self,
        contract: Option<&ContractHandle>,
        invocation: &Invocation,
        sink: &dyn StatusSink,
    ) -> CallResult {
        let result = self.run(contract, invocation, sink).await;
        sink.report(&result);
        result
    }

    async fn run(
        &self,
        contract: Option<&ContractHandle>,
        invocation: &Invocation,
        sink: &dyn StatusSink,
    ) -> CallResult {
        let Some(contract) = contract else {
            return CallResult::err("contract is not available");
        };
        if invocation.caller.trim().is_empty() {
            return CallResult::err("caller is not selected");
        }
        let Some(message) = contract.abi().find_message(&invocation.method) else {
            return CallResult::err(format!("{} is not a message of this contract", invocation.method));
        };

        let query = ContractCall {
            origin: invocation.caller.clone(),
            dest: contract.address().to_owned(),
            value: 0,
            gas_limit: None,
            message: message.identifier.clone(),
            args: invocation.params.clone(),
        };

        let connection = contract.connection();
        let outcome = match connection.dry_run(&query).await {
            Ok(outcome) => outcome,
            Err(err) => {
                error!(method = %query.message, "dry run failed: {}", err);
                return CallResult::err(err.to_string());
            }
        };

        let output = match &outcome.result {
            DryRunResult::Success { output } => output.as_ref().map(render_value).unwrap_or_default(),
            DryRunResult::Failure { reason } => return CallResult::err(reason.clone()),
        };

        if !invocation.is_transaction {
            return CallResult::ok(output);
        }

        if let Some(app_error) = outcome.application_error() {
            info!(method = %query.message, "dry run rejected transaction: {}", app_error);
            return CallResult::err(app_error);
        }

        let signing = match self.signers.resolve(connection, &invocation.caller).await {
            Ok(signing) => signing,
            Err(err) => {
                error!(caller = %invocation.caller, "signer resolution failed: {:#}", err);
                return CallResult::err(format!("{err:#}"));
            }
        };

        let submission = ContractCall {
            gas_limit: Some(outcome.gas_consumed),
            ..query
        };
        let mut statuses = match connection.submit_and_watch(&submission, &signing).await {
            Ok(statuses) => statuses,
            Err(err) => {
                error!(method = %submission.message, "submission failed: {}", err);
                return CallResult::err(err.to_string());
            }
        };

        while let Some(progress) = statuses.recv().await {
            let phase = progress.status.phase();
            if progress.status.is_finalized() {
                return match progress.dispatch_error {
                    Some(dispatch_error) => {
                        warn!(method = %submission.message, "transaction failed: {}", dispatch_error);
                        CallResult::err(dispatch_error)
                    }
                    None => {
                        info!(method = %submission.message, "transaction finalized");
                        CallResult::ok("Success")
                    }
                };
            }
            if progress.status.is_abandoned() {
                warn!(method = %submission.message, phase, "transaction abandoned");
                return CallResult::err(format!("transaction {phase}"));
            }
            sink.report(&CallResult::pending(format!("status: {phase}")));
        }

        warn!(method = %submission.message, "status stream ended before finalization");
        CallResult::err("transaction status stream ended before finalization")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::abi::resolve_contract;
    use crate::testing::{GENESIS, MockExtension, MockNode, points_contract, progress};
    use anyhow::Result;
    use pc_api_types::{CallOutcome, GenesisHash};
    use pc_extension::InjectedExtension;
    use pc_node_client::{DryRunOutcome, NodeError, TxProgress, TxStatus};
    use pc_storage::{InMemoryKeystore, Keyring};
    use serde_json::json;

    struct Fixture {
        node: Arc<MockNode>,
        extension: Arc<MockExtension>,
        orchestrator: CallOrchestrator,
        contract: Option<ContractHandle>,
    }

    impl Fixture {
        async fn new() -> Result<Self> {
            let node = MockNode::shared();
            let extension = MockExtension::with_account("alice");
            let keyring = Arc::new(Keyring::new(Arc::new(InMemoryKeystore::default())));
            keyring
                .load_all(&GenesisHash(GENESIS.to_owned()), extension.accounts().await?)
                .await?;

            let signers = Arc::new(SignerResolver::new(keyring, extension.clone(), "secret"));
            let contract = resolve_contract(&node.handle(), Some(&points_contract()));
            Ok(Self {
                node,
                extension,
                orchestrator: CallOrchestrator::new(signers),
                contract,
            })
        }

        fn invocation(&self, method: &str, is_transaction: bool) -> Invocation {
            Invocation {
                method: method.to_owned(),
                caller: self.extension.account_address(),
                is_transaction,
                params: vec![json!("5Store"), json!("5User"), json!(10)],
            }
        }

        async fn call(&self, method: &str, is_transaction: bool) -> (CallResult, Vec<CallResult>) {
            let cell = CallStatusCell::default();
            let result = self
                .orchestrator
                .invoke(self.contract.as_ref(), &self.invocation(method, is_transaction), &cell)
                .await;
            (result, cell.history())
        }
    }

    #[tokio::test]
    async fn query_renders_output() -> Result<()> {
        let fixture = Fixture::new().await?;
        fixture.node.set_output(json!(1200));

        let (result, history) = fixture.call("get_user_points", false).await;
        assert_eq!(result, CallResult::ok("1200"));
        assert_eq!(history, vec![CallResult::ok("1200")]);

        let call = fixture.node.last_call().unwrap_or_else(|| panic!("dry run recorded"));
        assert_eq!(call.value, 0);
        assert_eq!(call.gas_limit, None);
        assert_eq!(fixture.node.submission_count(), 0);
        Ok(())
    }

    #[tokio::test]
    async fn repeated_queries_are_stable() -> Result<()> {
        let fixture = Fixture::new().await?;
        fixture.node.set_output(json!(true));

        let (first, _) = fixture.call("isAuthority", false).await;
        let (second, _) = fixture.call("isAuthority", false).await;
        assert_eq!(first, second);
        assert_eq!(fixture.node.dry_run_count(), 2);
        Ok(())
    }

    #[tokio::test]
    async fn simulation_failure_and_transport_error_are_err() -> Result<()> {
        let fixture = Fixture::new().await?;

        fixture.node.set_dry_run(Ok(DryRunOutcome {
            gas_consumed: 0,
            result: DryRunResult::Failure {
                reason: "ContractTrapped".to_owned(),
            },
        }));
        let (result, _) = fixture.call("get_owner_points", false).await;
        assert_eq!(result, CallResult::err("ContractTrapped"));

        fixture.node.set_dry_run(Err(NodeError::Closed));
        let (result, _) = fixture.call("get_owner_points", false).await;
        assert_eq!(result, CallResult::err("connection closed"));
        Ok(())
    }

    #[tokio::test]
    async fn application_error_short_circuits_submission() -> Result<()> {
        let fixture = Fixture::new().await?;
        fixture.node.set_output(json!({ "Err": "InsufficientPoints" }));

        let (result, history) = fixture.call("useUserPoints", true).await;

        assert_eq!(result, CallResult::err("InsufficientPoints"));
        assert_eq!(history.len(), 1);
        assert_eq!(fixture.node.dry_run_count(), 1);
        assert_eq!(fixture.node.submission_count(), 0);
        assert_eq!(fixture.extension.mock_signer().call_count(), 0);
        Ok(())
    }

    #[tokio::test]
    async fn transaction_reports_phases_until_finalized() -> Result<()> {
        let fixture = Fixture::new().await?;

        let (result, history) = fixture.call("give_user_points", true).await;

        assert_eq!(result, CallResult::ok("Success"));
        assert_eq!(
            history,
            vec![
                CallResult::pending("status: Ready"),
                CallResult::pending("status: InBlock"),
                CallResult::ok("Success"),
            ]
        );

        let submitted = fixture.node.last_call().unwrap_or_else(|| panic!("submission recorded"));
        assert_eq!(submitted.gas_limit, Some(1_250_000_000));
        assert_eq!(submitted.message, "give_user_points");
        assert_eq!(fixture.node.last_signer(), Some(fixture.extension.account_address()));
        assert_eq!(fixture.extension.mock_signer().call_count(), 1);
        Ok(())
    }

    #[tokio::test]
    async fn finalized_dispatch_error_is_err() -> Result<()> {
        let fixture = Fixture::new().await?;
        fixture.node.script_transaction(vec![TxProgress {
            status: TxStatus::Finalized("0x02".to_owned()),
            dispatch_error: Some("NotAuthority".to_owned()),
        }]);

        let (result, _) = fixture.call("give_authority", true).await;
        assert_eq!(result, CallResult::err("NotAuthority"));
        Ok(())
    }

    #[tokio::test]
    async fn abandoned_or_truncated_transactions_settle() -> Result<()> {
        let fixture = Fixture::new().await?;

        fixture
            .node
            .script_transaction(vec![progress(TxStatus::Ready), progress(TxStatus::Dropped)]);
        let (result, _) = fixture.call("issuance_points", true).await;
        assert_eq!(result, CallResult::err("transaction Dropped"));

        fixture.node.script_transaction(vec![progress(TxStatus::Broadcast)]);
        let (result, history) = fixture.call("issuance_points", true).await;
        assert_eq!(result.outcome, CallOutcome::Err);
        assert_eq!(history.last(), Some(&result));
        Ok(())
    }

    #[tokio::test]
    async fn submission_transport_error_is_terminal() -> Result<()> {
        let fixture = Fixture::new().await?;
        fixture.node.fail_submission(NodeError::Transport("socket closed".to_owned()));

        let (result, _) = fixture.call("issuance_points", true).await;
        assert_eq!(result, CallResult::err("transport error: socket closed"));
        Ok(())
    }

    #[tokio::test]
    async fn preconditions_are_reported_as_err() -> Result<()> {
        let fixture = Fixture::new().await?;
        let cell = CallStatusCell::default();

        let no_contract = fixture
            .orchestrator
            .invoke(None, &fixture.invocation("get_owner_points", false), &cell)
            .await;
        assert_eq!(no_contract.outcome, CallOutcome::Err);

        let mut anonymous = fixture.invocation("get_owner_points", false);
        anonymous.caller.clear();
        let no_caller = fixture
            .orchestrator
            .invoke(fixture.contract.as_ref(), &anonymous, &cell)
            .await;
        assert_eq!(no_caller, CallResult::err("caller is not selected"));

        let (unknown, _) = fixture.call("does_not_exist", false).await;
        assert_eq!(unknown.outcome, CallOutcome::Err);
        assert_eq!(fixture.node.dry_run_count(), 0);
        Ok(())
    }

    #[tokio::test]
    async fn weak_sink_drops_reports_after_owner_is_gone() -> Result<()> {
        let fixture = Fixture::new().await?;
        let owner = Arc::new(CallStatusCell::default());
        let sink = WeakSink::new(&owner);

        fixture
            .orchestrator
            .invoke(fixture.contract.as_ref(), &fixture.invocation("get_owner_points", false), &sink)
            .await;
        assert_eq!(owner.history().len(), 1);

        drop(owner);
        let result = fixture
            .orchestrator
            .invoke(fixture.contract.as_ref(), &fixture.invocation("get_owner_points", false), &sink)
            .await;
        assert_eq!(result.outcome, CallOutcome::Ok);
        Ok(())
    }
}
