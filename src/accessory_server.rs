use crate::inverter_accessory::InverterAccessory;
use tokio::net::TcpListener;
use tokio_modbus::server::tcp::{accept_tcp_connection, Server};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Serves the accessory over Modbus TCP until `cancel` fires.
/// A cancelled server is a clean shutdown and returns `Ok`.
pub async fn serve(
    listener: TcpListener,
    accessory: InverterAccessory,
    cancel: CancellationToken,
) -> anyhow::Result<()> {
    let local_addr = listener.local_addr()?;
    info!(%local_addr, "accessory server listening");

    let server = Server::new(listener);
    let new_service = |_socket_addr| Ok(Some(accessory.clone()));
    let on_connected = |stream, socket_addr| async move {
        accept_tcp_connection(stream, socket_addr, new_service)
    };
    let on_process_error = |err| {
        warn!("accessory connection error: {err}");
    };

    tokio::select! {
        served = server.serve(&on_connected, on_process_error) => {
            served?;
            Ok(())
        }
        () = cancel.cancelled() => {
            info!("accessory server closed");
            Ok(())
        }
    }
}
