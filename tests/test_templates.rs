//! Template expansion through the engine

use anyhow::anyhow;
use arbor::execution::ExecutionContext;
use arbor::extension::InvocationContexts;
use arbor::{
    ConditionResult, Engine, EngineConfig, ExecutionCondition, Extension, NodeSpec, NodeStatus, NodeType,
    RegisteredExtension, TemplateInvocationContext, TemplateInvocationContextProvider, TestPlan, UniqueId,
};
use pretty_assertions::assert_eq;
use std::sync::Arc;

fn sequential() -> Engine {
    let config = EngineConfig::builder().parallel(false).build().unwrap();
    Engine::new(config).unwrap()
}

fn id(path: &str) -> UniqueId {
    path.parse().unwrap()
}

/// Supplies `count` invocations to every template
struct Repeat {
    count: usize,
    label: &'static str,
    zero_allowed: bool,
}

impl Repeat {
    fn times(count: usize) -> Self {
        Self {
            count,
            label: "run",
            zero_allowed: false,
        }
    }
}

impl Extension for Repeat {
    fn as_template_provider(&self) -> Option<&dyn TemplateInvocationContextProvider> {
        Some(self)
    }
}

impl TemplateInvocationContextProvider for Repeat {
    fn supports(&self, ctx: &ExecutionContext) -> bool {
        ctx.node_type() == NodeType::Template
    }

    fn provide_invocation_contexts(&self, _ctx: &ExecutionContext) -> anyhow::Result<InvocationContexts> {
        let label = self.label;
        Ok(Box::new(
            (0..self.count).map(move |_| Box::new(Labeled { label, disable: false }) as Box<dyn TemplateInvocationContext>),
        ))
    }

    fn may_return_zero_invocation_contexts(&self, _ctx: &ExecutionContext) -> bool {
        self.zero_allowed
    }
}

struct Labeled {
    label: &'static str,
    disable: bool,
}

impl TemplateInvocationContext for Labeled {
    fn display_name(&self, invocation_index: usize) -> String {
        format!("{} {}", self.label, invocation_index)
    }

    fn additional_extensions(&self) -> Vec<RegisteredExtension> {
        if self.disable {
            vec![RegisteredExtension::of(Disabled)]
        } else {
            Vec::new()
        }
    }
}

struct Disabled;

impl Extension for Disabled {
    fn as_execution_condition(&self) -> Option<&dyn ExecutionCondition> {
        Some(self)
    }
}

impl ExecutionCondition for Disabled {
    fn evaluate(&self, _ctx: &ExecutionContext) -> ConditionResult {
        ConditionResult::disabled("disabled for this invocation")
    }
}

fn template_plan(template: NodeSpec) -> Arc<TestPlan> {
    TestPlan::new(NodeSpec::engine("arbor").with_child(NodeSpec::class("Suite", "Suite").with_child(template))).unwrap()
}

const TEMPLATE: &str = "[engine:arbor]/[class:Suite]/[test-template:t]";

#[tokio::test]
async fn test_template_fans_out_into_invocations() {
    let plan = template_plan(NodeSpec::template("t", "t()").with_extension(RegisteredExtension::of(Repeat::times(2))));

    let results = sequential().execute(plan.clone()).await;
    assert!(results.succeeded());
    assert_eq!(
        results.descriptions_below(&id(TEMPLATE)),
        vec![
            format!("started {}", TEMPLATE),
            format!("registered {}/[template-invocation:#1]", TEMPLATE),
            format!("registered {}/[template-invocation:#2]", TEMPLATE),
            format!("started {}/[template-invocation:#1]", TEMPLATE),
            format!("finished {}/[template-invocation:#1] succeeded", TEMPLATE),
            format!("started {}/[template-invocation:#2]", TEMPLATE),
            format!("finished {}/[template-invocation:#2] succeeded", TEMPLATE),
            format!("finished {} succeeded", TEMPLATE),
        ]
    );
    let first = results
        .report
        .get(&id(&format!("{}/[template-invocation:#1]", TEMPLATE)))
        .unwrap();
    assert_eq!(first.display_name, "run 1");
    assert_eq!(first.node_type, NodeType::Invocation);
}

#[tokio::test]
async fn test_prototype_children_are_copied_per_invocation() {
    let plan = template_plan(
        NodeSpec::template("t", "t()")
            .with_extension(RegisteredExtension::of(Repeat::times(2)))
            .with_child(NodeSpec::test("case", "case()").with_execute(|ctx| {
                let parent = ctx.unique_id().parent().ok_or_else(|| anyhow!("orphan"))?;
                anyhow::ensure!(parent.to_string().contains("template-invocation"));
                Ok(())
            })),
    );

    let results = sequential().execute(plan).await;
    assert!(results.succeeded());
    for index in 1..=2 {
        let case = id(&format!("{}/[template-invocation:#{}]/[test:case]", TEMPLATE, index));
        assert_eq!(results.status_of(&case), Some(NodeStatus::Succeeded));
    }
    assert_eq!(results.report.test_counts().get(&NodeStatus::Succeeded), Some(&2));
}

#[tokio::test]
async fn test_providers_share_one_index_sequence() {
    let second = Repeat {
        count: 1,
        label: "extra",
        zero_allowed: false,
    };
    let plan = template_plan(
        NodeSpec::template("t", "t()")
            .with_extension(RegisteredExtension::of(Repeat::times(2)))
            .with_extension(RegisteredExtension::of(second)),
    );

    let results = sequential().execute(plan).await;
    assert!(results.succeeded());
    let third = results
        .report
        .get(&id(&format!("{}/[template-invocation:#3]", TEMPLATE)))
        .unwrap();
    assert_eq!(third.display_name, "extra 3");
}

#[tokio::test]
async fn test_template_without_provider_fails() {
    let plan = template_plan(NodeSpec::template("t", "t()"));

    let results = sequential().execute(plan).await;
    let template = results.report.get(&id(TEMPLATE)).unwrap();
    assert_eq!(template.status, NodeStatus::Failed);
    assert!(template.failure_chain[0].contains(
        "You must register at least one TemplateInvocationContextProvider that supports template [t()]"
    ));
    assert_eq!(results.root.status, NodeStatus::Failed);
}

#[tokio::test]
async fn test_provider_returning_nothing_must_opt_in() {
    let plan = template_plan(NodeSpec::template("t", "t()").with_extension(RegisteredExtension::of(Repeat::times(0))));

    let results = sequential().execute(plan).await;
    let template = results.report.get(&id(TEMPLATE)).unwrap();
    assert_eq!(template.status, NodeStatus::Failed);
    assert!(template.failure_chain[0].contains("Provider [Repeat] did not provide any invocation contexts"));
    assert!(template.failure_chain[0].contains("may_return_zero_invocation_contexts()"));

    let allowed = Repeat {
        count: 0,
        label: "run",
        zero_allowed: true,
    };
    let plan = template_plan(NodeSpec::template("t", "t()").with_extension(RegisteredExtension::of(allowed)));
    let results = sequential().execute(plan).await;
    assert!(results.succeeded());
    assert_eq!(
        results.descriptions_below(&id(TEMPLATE)),
        vec![format!("started {}", TEMPLATE), format!("finished {} succeeded", TEMPLATE)]
    );
}

#[tokio::test]
async fn test_discovery_selection_limits_invocations() {
    let root = NodeSpec::engine("arbor").with_child(
        NodeSpec::class("Suite", "Suite").with_child(
            NodeSpec::template("t", "t()")
                .with_extension(RegisteredExtension::of(Repeat::times(3)))
                .with_child(NodeSpec::invocation(2).with_child(NodeSpec::test("case", "case()"))),
        ),
    );
    let plan = TestPlan::discover(root, |_| true).unwrap();

    let results = sequential().execute(plan).await;
    assert!(results.succeeded());
    let registered: Vec<String> = results
        .event_descriptions()
        .into_iter()
        .filter(|d| d.starts_with("registered"))
        .collect();
    assert_eq!(registered, vec![format!("registered {}/[template-invocation:#2]", TEMPLATE)]);
    assert_eq!(
        results.status_of(&id(&format!("{}/[template-invocation:#2]/[test:case]", TEMPLATE))),
        Some(NodeStatus::Succeeded)
    );
}

/// Hands out invocations whose second one carries a disabling condition
struct SecondDisabled;

impl Extension for SecondDisabled {
    fn as_template_provider(&self) -> Option<&dyn TemplateInvocationContextProvider> {
        Some(self)
    }
}

impl TemplateInvocationContextProvider for SecondDisabled {
    fn supports(&self, _ctx: &ExecutionContext) -> bool {
        true
    }

    fn provide_invocation_contexts(&self, _ctx: &ExecutionContext) -> anyhow::Result<InvocationContexts> {
        Ok(Box::new((1..=3).map(|i| {
            Box::new(Labeled {
                label: "case",
                disable: i == 2,
            }) as Box<dyn TemplateInvocationContext>
        })))
    }
}

#[tokio::test]
async fn test_invocation_extensions_apply_to_that_invocation_only() {
    let plan = template_plan(NodeSpec::template("t", "t()").with_extension(RegisteredExtension::of(SecondDisabled)));

    let results = sequential().execute(plan).await;
    assert!(results.succeeded());
    let statuses: Vec<Option<NodeStatus>> = (1..=3)
        .map(|i| results.status_of(&id(&format!("{}/[template-invocation:#{}]", TEMPLATE, i))))
        .collect();
    assert_eq!(
        statuses,
        vec![Some(NodeStatus::Succeeded), Some(NodeStatus::Skipped), Some(NodeStatus::Succeeded)]
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_concurrent_invocations_complete() {
    let plan = template_plan(
        NodeSpec::template("t", "t()")
            .with_extension(RegisteredExtension::of(Repeat::times(8)))
            .with_child(NodeSpec::test("case", "case()")),
    );

    let results = Engine::new(EngineConfig::concurrent(2)).unwrap().execute(plan).await;
    assert!(results.succeeded());
    assert_eq!(results.report.test_counts().get(&NodeStatus::Succeeded), Some(&8));
}
