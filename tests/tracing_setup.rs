// Global subscriber installation; runs in its own test binary so nothing else installs one first

#[cfg(test)]
mod tests {
    use tether::tracing_setup::{init_console_tracing, init_tracing, init_tracing_with_config};

    #[test]
    fn test_only_first_subscriber_installs() {
        init_console_tracing().unwrap();
        tracing::warn!("console subscriber installed");

        assert!(init_tracing().is_err());
        assert!(init_tracing_with_config("debug", true, true).is_err());
    }
}
