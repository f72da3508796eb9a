use crate::core::errors::{EngineError, LifecyclePhase, Result};
use crate::execution::context::ExecutionContext;
use crate::execution::dynamic::DynamicRegistrar;
use crate::extension::{RegisteredExtension, TemplateInvocationContext};
use crate::tree::{NodeId, TestPlan};
use std::sync::Arc;
use tracing::{debug, info};

/// Turns a template node into one invocation child per provided context.
///
/// Providers are consulted in registration order and share one 1-based
/// index sequence. Indices excluded by discovery-time selection are counted
/// but not materialized. Returns the number of invocations registered.
pub(crate) fn expand_template(
    plan: &TestPlan,
    template: NodeId,
    ctx: &ExecutionContext,
    registrar: &DynamicRegistrar,
) -> Result<usize> {
    let entry = plan.entry(template)?;
    let state = entry
        .template_state()
        .cloned()
        .ok_or_else(|| EngineError::internal(format!("{} is not a template", entry.unique_id())))?;

    let providers: Vec<RegisteredExtension> = ctx
        .registry()
        .extensions()
        .into_iter()
        .filter(|registered| {
            registered
                .extension()
                .as_template_provider()
                .is_some_and(|provider| provider.supports(ctx))
        })
        .collect();
    if providers.is_empty() {
        return Err(EngineError::configuration(format!(
            "You must register at least one TemplateInvocationContextProvider that supports template [{}]",
            entry.display_name()
        )));
    }

    let mut index = 0;
    let mut registered = 0;
    for registered_provider in &providers {
        let Some(provider) = registered_provider.extension().as_template_provider() else {
            continue;
        };
        let contexts = provider
            .provide_invocation_contexts(ctx)
            .map_err(|e| EngineError::execution(entry.unique_id().to_string(), LifecyclePhase::Execute, e))?;

        let mut provided = 0;
        for invocation in contexts {
            if ctx.is_cancelled() {
                info!("Stopping expansion of {} after {} invocation(s): run cancelled", entry.unique_id(), registered);
                return Ok(registered);
            }
            index += 1;
            provided += 1;
            if !state.is_index_allowed(index) {
                debug!("Invocation #{} of {} was not selected", index, entry.unique_id());
                continue;
            }
            let display_name = invocation.display_name(index);
            let context: Arc<dyn TemplateInvocationContext> = Arc::from(invocation);
            let node = plan.materialize_invocation(template, index, display_name, context)?;
            registrar.register_existing(node)?;
            registered += 1;
        }

        if provided == 0 && !provider.may_return_zero_invocation_contexts(ctx) {
            return Err(EngineError::configuration(format!(
                "Provider [{}] did not provide any invocation contexts, but was expected to do so. \
                 You may override may_return_zero_invocation_contexts() to allow this.",
                registered_provider.extension().name()
            )));
        }
    }
    Ok(registered)
}
