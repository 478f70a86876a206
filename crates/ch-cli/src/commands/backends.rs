use ch_core::config::Config;
use ch_intelligence::providers::credential_var;
use ch_intelligence::credentials_available;

/// Run the `backends` subcommand: list configured backends and whether
/// their credentials resolve. Never prints key values.
pub fn run(config: &Config) {
    if config.backends.is_empty() {
        println!("No backends configured.");
        return;
    }

    println!(
        "{:<16} {:<10} {:<28} {:<8} credentials",
        "name", "provider", "model", "enabled"
    );
    println!("{}", "-".repeat(76));
    for backend in &config.backends {
        println!(
            "{:<16} {:<10} {:<28} {:<8} {}",
            backend.name,
            format!("{:?}", backend.provider).to_lowercase(),
            backend.model,
            if backend.enabled { "yes" } else { "no" },
            credential_status(backend),
        );
    }

    if let Some(critic) = &config.critique.critic {
        println!("\nCritic: {critic}");
    }
}

fn credential_status(backend: &ch_core::config::BackendConfig) -> String {
    match credential_var(backend) {
        None => "not required".to_string(),
        Some(var) if credentials_available(backend) => format!("{var} set"),
        Some(var) => format!("{var} missing"),
    }
}
