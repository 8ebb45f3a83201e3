use tracing_subscriber::{EnvFilter, fmt};

/// Instala o subscriber `fmt` global. `RUST_LOG` tem precedência sobre
/// `verbose`. Chamar duas vezes não tem efeito.
pub fn init(verbose: bool) {
    let fallback = if verbose { "relaunch=debug,info" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(fallback));
    let _ = fmt().with_env_filter(filter).with_target(false).try_init();
}
