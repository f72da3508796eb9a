//! Extensions, their capabilities, and the registry that orders them

pub mod capability;
pub mod registry;

pub use capability::{
    ConditionResult, ExecutionCondition, Extension, InvocationContexts, LifecycleCallback, RegisteredExtension,
    TemplateInvocationContext, TemplateInvocationContextProvider, TestInstance,
};
pub use registry::{ExtensionInitializer, ExtensionRegistry, OwnerType, RegistrationCategory};
