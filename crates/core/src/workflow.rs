//! Multi-step workflow simulator.

use crate::capability::{
    CapabilityDeclaration, CapabilityError, CapabilityProvider, parameters_schema, restrict_to,
};
use async_trait::async_trait;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{info, warn};
use uuid::Uuid;

pub const WORKFLOW_CAPABILITY: &str = "execute_workflow";
pub const DEFAULT_STEP_DELAY: Duration = Duration::from_millis(500);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkflowKind {
    CustomerOnboarding,
    SupportTicket,
    OrderProcessing,
    DataAnalysis,
}

impl WorkflowKind {
    pub const ALL: [WorkflowKind; 4] = [
        Self::CustomerOnboarding,
        Self::SupportTicket,
        Self::OrderProcessing,
        Self::DataAnalysis,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::CustomerOnboarding => "customer_onboarding",
            Self::SupportTicket => "support_ticket",
            Self::OrderProcessing => "order_processing",
            Self::DataAnalysis => "data_analysis",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|k| k.as_str() == name)
    }

    pub fn steps(self) -> &'static [&'static str] {
        match self {
            Self::CustomerOnboarding => &[
                "verify_identity",
                "create_account",
                "send_welcome_email",
                "schedule_followup",
            ],
            Self::SupportTicket => &[
                "categorize_issue",
                "check_knowledge_base",
                "create_ticket",
                "assign_agent",
                "send_confirmation",
            ],
            Self::OrderProcessing => &[
                "validate_order",
                "check_inventory",
                "process_payment",
                "generate_invoice",
                "arrange_shipping",
            ],
            Self::DataAnalysis => &["fetch_data", "clean_data", "run_analysis", "generate_report"],
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct WorkflowReport {
    pub workflow_id: Uuid,
    #[serde(rename = "type")]
    pub workflow_type: String,
    pub status: &'static str,
    pub steps_executed: Vec<String>,
    pub duration_ms: u64,
    pub parameters: Value,
}

#[derive(Debug, Deserialize, JsonSchema)]
pub struct WorkflowArgs {
    /// Type of workflow to execute
    pub workflow_type: String,
    /// Workflow-specific parameters
    #[serde(default)]
    pub parameters: Map<String, Value>,
}

/// Runs one of the canonical workflows as a sequence of delayed steps.
pub struct WorkflowSimulator {
    step_delay: Duration,
    timeout: Option<Duration>,
}

impl Default for WorkflowSimulator {
    fn default() -> Self {
        Self::new(DEFAULT_STEP_DELAY)
    }
}

impl WorkflowSimulator {
    pub fn new(step_delay: Duration) -> Self {
        Self {
            step_delay,
            timeout: None,
        }
    }

    /// Overrides the owning set's default bound for this capability.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Executes the workflow. Unknown workflow types complete immediately
    /// with no steps.
    pub async fn run(&self, workflow_type: &str, parameters: Map<String, Value>) -> WorkflowReport {
        let workflow_id = Uuid::new_v4();
        let started = Instant::now();

        let steps = match WorkflowKind::from_name(workflow_type) {
            Some(kind) => kind.steps(),
            None => {
                warn!(%workflow_type, "Unknown workflow type, nothing to execute");
                &[]
            }
        };

        let mut steps_executed = Vec::with_capacity(steps.len());
        for step in steps {
            tokio::time::sleep(self.step_delay).await;
            steps_executed.push(step.to_string());
            info!(%workflow_id, %step, "Workflow step completed");
        }

        WorkflowReport {
            workflow_id,
            workflow_type: workflow_type.to_string(),
            status: "completed",
            steps_executed,
            duration_ms: started.elapsed().as_millis() as u64,
            parameters: Value::Object(parameters),
        }
    }
}

#[async_trait]
impl CapabilityProvider for WorkflowSimulator {
    fn name(&self) -> &str {
        WORKFLOW_CAPABILITY
    }

    fn declaration(&self) -> CapabilityDeclaration {
        let mut parameters = parameters_schema::<WorkflowArgs>();
        let kinds: Vec<String> = WorkflowKind::ALL
            .iter()
            .map(|k| k.as_str().to_string())
            .collect();
        restrict_to(&mut parameters, "workflow_type", &kinds);

        CapabilityDeclaration {
            name: WORKFLOW_CAPABILITY.to_string(),
            description: "Execute a multi-step workflow".to_string(),
            parameters,
        }
    }

    fn timeout(&self, _arguments: &Value) -> Option<Duration> {
        self.timeout
    }

    async fn invoke(&self, arguments: Value) -> Result<Value, CapabilityError> {
        let args: WorkflowArgs = serde_json::from_value(arguments)
            .map_err(|e| CapabilityError::InvalidArguments(e.to_string()))?;
        let report = self.run(&args.workflow_type, args.parameters).await;
        serde_json::to_value(report).map_err(|e| CapabilityError::InvalidArguments(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn support_ticket_runs_all_steps_in_order() {
        let simulator = WorkflowSimulator::new(Duration::from_millis(1));
        let report = simulator.run("support_ticket", Map::new()).await;
        assert_eq!(
            report.steps_executed,
            vec![
                "categorize_issue",
                "check_knowledge_base",
                "create_ticket",
                "assign_agent",
                "send_confirmation"
            ]
        );
        assert_eq!(report.status, "completed");
    }

    #[tokio::test]
    async fn unknown_workflow_succeeds_with_no_steps() {
        let simulator = WorkflowSimulator::default();
        let value = simulator
            .invoke(json!({ "workflow_type": "nonexistent_workflow", "parameters": {} }))
            .await
            .unwrap();
        assert_eq!(value["steps_executed"], json!([]));
        assert_eq!(value["type"], "nonexistent_workflow");
        assert_eq!(value["status"], "completed");
    }

    #[tokio::test(start_paused = true)]
    async fn each_step_waits_the_configured_delay() {
        let simulator = WorkflowSimulator::new(Duration::from_millis(500));
        let report = simulator.run("data_analysis", Map::new()).await;
        assert_eq!(report.steps_executed.len(), 4);
        assert!(report.duration_ms >= 2_000);
    }

    #[tokio::test]
    async fn parameters_are_echoed() {
        let simulator = WorkflowSimulator::new(Duration::ZERO);
        let value = simulator
            .invoke(json!({ "workflow_type": "order_processing", "parameters": { "order_id": 42 } }))
            .await
            .unwrap();
        assert_eq!(value["parameters"]["order_id"], 42);
        assert!(Uuid::parse_str(value["workflow_id"].as_str().unwrap()).is_ok());
    }

    #[test]
    fn declaration_enumerates_workflows() {
        let declaration = WorkflowSimulator::default().declaration();
        assert_eq!(
            declaration.parameters["properties"]["workflow_type"]["enum"],
            json!(["customer_onboarding", "support_ticket", "order_processing", "data_analysis"])
        );
        assert_eq!(declaration.parameters["required"], json!(["workflow_type"]));
    }
}
