//! Accept loop dispatching framed requests to an [`RpcHandler`].

use std::sync::Arc;

use tokio::net::{TcpListener, TcpStream};

use crate::{Request, Response, WireError, codec};

/// Application-side request dispatcher.
///
/// Implementations translate every internal failure into a status code on
/// the [`Response`]; the serve loop only sees transport faults.
pub trait RpcHandler: Send + Sync + 'static {
    fn handle(&self, request: Request) -> impl Future<Output = Response> + Send;
}

/// Serves connections from `listener` until the task is dropped.
///
/// One task per connection; requests on a connection are handled in
/// order. Run under `tokio::select!` with a shutdown signal to stop.
pub async fn serve<H: RpcHandler>(listener: TcpListener, handler: Arc<H>) -> Result<(), WireError> {
    loop {
        let (stream, peer) = listener.accept().await?;
        let handler = Arc::clone(&handler);
        tokio::spawn(async move {
            if let Err(e) = handle_connection(stream, handler).await {
                match e {
                    WireError::ConnectionClosed => {
                        tracing::debug!(peer = %peer, "connection closed");
                    }
                    other => {
                        tracing::warn!(peer = %peer, error = %other, "connection error");
                    }
                }
            }
        });
    }
}

async fn handle_connection<H: RpcHandler>(
    mut stream: TcpStream,
    handler: Arc<H>,
) -> Result<(), WireError> {
    loop {
        let request: Request = codec::read_frame(&mut stream).await?;
        let response = handler.handle(request).await;
        codec::write_frame(&mut stream, &response).await?;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{RequestPayload, ResponsePayload, RpcClient};
    use skein_types::{AppId, StatusCode};
    use std::time::Duration;

    struct EchoHandler;

    impl RpcHandler for EchoHandler {
        async fn handle(&self, request: Request) -> Response {
            match request.payload {
                RequestPayload::AppHeartbeat { app_id } => Response {
                    id: request.id,
                    status: StatusCode::Success,
                    message: format!("SUCCESS heartbeat from {app_id}"),
                    payload: ResponsePayload::None,
                },
                _ => Response::status(request.id, StatusCode::InvalidRequest, "unsupported"),
            }
        }
    }

    #[tokio::test]
    async fn client_server_round_trip() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let server = tokio::spawn(serve(listener, Arc::new(EchoHandler)));

        let client = RpcClient::new(addr.to_string(), Duration::from_secs(5));
        let response = client
            .call(RequestPayload::AppHeartbeat {
                app_id: AppId::from("app-x"),
            })
            .await
            .unwrap();
        assert!(response.is_success());
        assert!(response.message.contains("app-x"));

        // Connection reuse: a second call on the same client.
        let response = client
            .call(RequestPayload::AppHeartbeat {
                app_id: AppId::from("app-y"),
            })
            .await
            .unwrap();
        assert!(response.is_success());

        server.abort();
    }

    #[tokio::test]
    async fn unsupported_verb_gets_invalid_request() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let server = tokio::spawn(serve(listener, Arc::new(EchoHandler)));

        let client = RpcClient::new(addr.to_string(), Duration::from_secs(5));
        let response = client.call(RequestPayload::FetchClientConf).await.unwrap();
        assert_eq!(response.status, StatusCode::InvalidRequest);

        server.abort();
    }
}
