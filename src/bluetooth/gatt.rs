/// Bluetooth Low Energy GATT peripheral served through BlueZ
///
/// Service layout:
/// - Data (gateway-specific UUID, write): authenticated telemetry frames
/// - Pair-request (write): `addr ‖ publicKey [‖ capabilities]`
/// - Pair-response (read + write): current offer on read, confirmation on write
///
/// Write handlers only spawn a task and return, so BlueZ never waits on
/// signature checks or delivery.
use bluer::adv::Advertisement;
use bluer::gatt::local::{
    Application, ApplicationHandle, Characteristic, CharacteristicRead, CharacteristicWrite,
    CharacteristicWriteMethod, Service,
};
use futures_util::FutureExt;
use log::{debug, error, info};
use std::future::Future;
use std::sync::Arc;
use uuid::Uuid;

use crate::gateway::Gateway;

// Identical across deployments; the data characteristic UUID is per gateway
pub const SERVICE_UUID: Uuid = Uuid::from_u128(0xA07498CA_AD5B_474E_940D_16F1FBE7E8CD);
pub const PAIR_REQUEST_UUID: Uuid = Uuid::from_u128(0x0000FE55_0000_FE55_0000_FE550000FE55);
pub const PAIR_RESPONSE_UUID: Uuid = Uuid::from_u128(0x0000FE56_0000_FE56_0000_FE560000FE56);

/// Registered GATT application. Dropping it removes the service; the
/// advertisement is owned by the [`Gateway`] so `STOP` can end it.
pub struct Peripheral {
    _application: ApplicationHandle,
}

/// Powers the default adapter, registers the gateway service and starts advertising.
pub async fn start_peripheral(
    gateway: Arc<Gateway>,
    advertised_name: &str,
) -> Result<Peripheral, Box<dyn std::error::Error>> {
    // Initialize Bluetooth session
    let session = match bluer::Session::new().await {
        Ok(session) => session,
        Err(e) => {
            error!("Failed to create Bluetooth session: {}", e);
            return Err(e.into());
        }
    };

    // Get the default Bluetooth adapter
    let adapter = match session.default_adapter().await {
        Ok(adapter) => adapter,
        Err(e) => {
            error!("Failed to get default Bluetooth adapter: {}", e);
            return Err(e.into());
        }
    };

    // Ensure Bluetooth adapter is powered on
    if let Err(e) = adapter.set_powered(true).await {
        error!("Failed to power on adapter: {}", e);
        return Err(e.into());
    }

    let data_channel = gateway.settings.read().await.data_channel;
    let application = Application {
        services: vec![Service {
            uuid: SERVICE_UUID,
            primary: true,
            characteristics: vec![
                write_characteristic(data_channel, &gateway, |gateway, value| async move {
                    gateway.on_data(&value).await;
                }),
                write_characteristic(PAIR_REQUEST_UUID, &gateway, |gateway, value| async move {
                    gateway.pairing.on_pair_request(&value).await;
                }),
                pair_response_characteristic(&gateway),
            ],
            ..Default::default()
        }],
        ..Default::default()
    };

    let application = match adapter.serve_gatt_application(application).await {
        Ok(handle) => handle,
        Err(e) => {
            error!("Failed to register GATT application: {}", e);
            return Err(e.into());
        }
    };

    let advertisement = Advertisement {
        service_uuids: [SERVICE_UUID].into_iter().collect(),
        discoverable: Some(true),
        local_name: Some(advertised_name.to_string()),
        ..Default::default()
    };
    let advertisement = match adapter.advertise(advertisement).await {
        Ok(handle) => handle,
        Err(e) => {
            error!("Failed to start advertising: {}", e);
            return Err(e.into());
        }
    };

    info!(
        "Advertising '{}' on {} (data channel {})",
        advertised_name,
        adapter.name(),
        data_channel
    );
    gateway.set_advertising(Box::new(advertisement));
    Ok(Peripheral {
        _application: application,
    })
}

/// Write-only characteristic whose writes are handled by `handler` on a spawned task.
fn write_characteristic<F, Fut>(uuid: Uuid, gateway: &Arc<Gateway>, handler: F) -> Characteristic
where
    F: Fn(Arc<Gateway>, Vec<u8>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    let gateway = Arc::clone(gateway);
    Characteristic {
        uuid,
        write: Some(CharacteristicWrite {
            write: true,
            write_without_response: true,
            method: CharacteristicWriteMethod::Fun(Box::new(move |value, request| {
                debug!(
                    "Write of {} bytes to {} from {}",
                    value.len(),
                    uuid,
                    request.device_address
                );
                tokio::spawn(handler(Arc::clone(&gateway), value));
                async move { Ok(()) }.boxed()
            })),
            ..Default::default()
        }),
        ..Default::default()
    }
}

fn pair_response_characteristic(gateway: &Arc<Gateway>) -> Characteristic {
    let response = gateway.response.clone();
    let mut characteristic =
        write_characteristic(PAIR_RESPONSE_UUID, gateway, |gateway, value| async move {
            gateway.pairing.on_confirmation(&value).await;
        });
    characteristic.read = Some(CharacteristicRead {
        read: true,
        fun: Box::new(move |_request| {
            let value = response.get();
            async move { Ok(value) }.boxed()
        }),
        ..Default::default()
    });
    characteristic
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fixed_uuids() {
        assert_eq!(
            SERVICE_UUID.to_string(),
            "a07498ca-ad5b-474e-940d-16f1fbe7e8cd"
        );
        assert_eq!(
            PAIR_REQUEST_UUID.to_string(),
            "0000fe55-0000-fe55-0000-fe550000fe55"
        );
        assert_eq!(
            PAIR_RESPONSE_UUID.to_string(),
            "0000fe56-0000-fe56-0000-fe560000fe56"
        );
    }
}
