//! Secret handling: where secrets come from, how they are rendered into the
//! privileged module and how that module is erased again.

pub mod injector;
pub mod store;
pub mod template;

pub use injector::{
    MaterializedSecrets, SecretInjector, SecretRequirement, TemplateFile, TemplateSet, TokenRule,
    DEFAULT_RULES, ERASE_CLEANUP_NAME, KUBECONFIG_FILE,
};
pub use store::{AmbientSecretStore, SecretKey, SecretStore, SecretValue, StaticSecretStore};
pub use template::{render, EscapeRule, Substitution};
