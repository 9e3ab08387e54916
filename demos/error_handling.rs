use std::time::Duration;

use authpipe::prelude::{
    AuthEndpoint, AuthProvider, Error, HyperTransport, Pipeline, RetryPolicy,
};
use authpipe::TransportConfig;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let transport = HyperTransport::new(&TransportConfig::default())?;
    let auth = AuthProvider::new(
        transport.clone(),
        AuthEndpoint::try_post("https://httpbin.org/status/503")?,
    )
    .with_credential("expired");

    let pipeline = Pipeline::builder("https://httpbin.org")
        .client_name("authpipe-example-error-handling")
        .request_timeout(Duration::from_secs(3))
        .retry_policy(RetryPolicy::disabled())
        .refresh_retry_policy(RetryPolicy::fixed_delay(1, Duration::from_millis(200)))
        .auth_provider(auth)
        .transport(transport)
        .build()?;

    for path in ["/status/500", "/status/401"] {
        let result = pipeline.get(path).send().await;
        match result {
            Ok(response) => {
                println!("unexpected success: status={}", response.status());
            }
            Err(error) => {
                println!("path={path} error_code={}", error.code().as_str());
                match &error {
                    Error::ServerStatus { status, body, .. } => {
                        println!("server error: status={status} body={body}");
                    }
                    Error::AuthRefresh {
                        unauthorized_body,
                        source,
                        ..
                    } => {
                        println!("refresh failed: source={source} original_body={unauthorized_body}");
                    }
                    Error::Unauthorized { after_refresh, .. } => {
                        println!("unauthorized: after_refresh={after_refresh}");
                    }
                    Error::Transport { kind, .. } => {
                        println!("transport error kind={kind}");
                    }
                    other => {
                        println!("other error: {other}");
                    }
                }
            }
        }
    }

    Ok(())
}
