//! Full client-to-server executions through the public client API.
//!
//! The client bridges the test process's stdio, so the commands used
//! here communicate through exit codes rather than output.

#![cfg(unix)]

use std::path::Path;
use std::sync::Arc;

use k8psh::client;
use k8psh::config::Configuration;
use k8psh::server::{self, ServerSettings};

fn start_server(config_template: &str) -> Arc<Configuration> {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let port = listener.local_addr().unwrap().port();
    let text = config_template.replace("{port}", &port.to_string());
    let configuration = Arc::new(Configuration::parse(&text, Path::new("/tmp")).unwrap());

    let settings = ServerSettings {
        name: "h".to_string(),
        max_connections: -1,
        timeout_ms: -1,
        no_wait: false,
        handle_hup: false,
    };

    tokio::spawn(server::run(listener, configuration.clone(), settings));
    configuration
}

#[tokio::test]
async fn the_remote_exit_code_becomes_the_client_result() {
    let configuration = start_server("[h:{port}]\nfail = /bin/sh -c \"exit 42\"");
    let command = configuration.command("fail").unwrap();

    let code = client::run_remote_command("", command, &[], &configuration)
        .await
        .unwrap();

    assert_eq!(code, 42);
}

#[tokio::test]
async fn tail_arguments_reach_the_child() {
    let configuration = start_server(
        r#"[h:{port}]
args = /bin/sh -c "test \"$1\" = expected" shell"#,
    );
    let command = configuration.command("args").unwrap();

    let code = client::run_remote_command("", command, &["expected".to_string()], &configuration)
        .await
        .unwrap();

    assert_eq!(code, 0);
}

#[tokio::test]
async fn client_environment_reaches_the_child() {
    std::env::set_var("K8PSH_CLIENT_E2E_X", "world");

    let configuration = start_server(
        r#"[h:{port}]
check K8PSH_CLIENT_E2E_X= = /bin/sh -c "test \"$K8PSH_CLIENT_E2E_X\" = world""#,
    );
    let command = configuration.command("check").unwrap();

    let code = client::run_remote_command("", command, &[], &configuration)
        .await
        .unwrap();

    assert_eq!(code, 0);
}

#[tokio::test]
async fn unknown_commands_are_fatal_on_the_client() {
    let configuration = start_server("[h:{port}]\nknown = /bin/true");

    assert!(configuration.command("unknown").is_none());
}
