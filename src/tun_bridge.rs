//! Virtual-interface ingress: bring the device up, then shuttle raw IP
//! packets between it and the tunnel transport.

use std::io;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::sync::Arc;

use anyhow::Context as _;
use bytes::Bytes;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::device::{AddressFamily, DevicePlatform, PacketDevice};
use crate::error::DeviceError;
use crate::transport::PacketTransport;

/// Largest packet read from the device in one call.
const DEVICE_READ_BUF: usize = 65535;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BringUp {
    pub name: String,
    pub mtu: u16,
    pub ipv4: Option<Ipv4Addr>,
    pub ipv6: Option<Ipv6Addr>,
}

/// Create the device and configure each requested family.
///
/// IPv4 and IPv6 are configured independently: a failure in one family
/// stops that family's remaining steps but the other is still attempted.
/// Every failure is returned, wrapped with the family it belongs to.
pub fn bring_up<P: DevicePlatform>(platform: &P, plan: &BringUp) -> Result<P::Device, DeviceError> {
    let device = platform.create(&plan.name, plan.mtu)?;
    let existing = platform.addresses(&device).unwrap_or_else(|e| {
        warn!(name = %plan.name, error = ?e.to_string(), "tun_address_list_failed");
        Vec::new()
    });

    let wanted = [plan.ipv4.map(IpAddr::V4), plan.ipv6.map(IpAddr::V6)];
    let failures: Vec<DeviceError> = wanted
        .into_iter()
        .flatten()
        .filter_map(|ip| configure_family(platform, &device, ip, plan.mtu, &existing).err())
        .collect();

    if failures.is_empty() {
        info!(
            name = %plan.name,
            id = %platform.stable_id(&plan.name),
            mtu = plan.mtu,
            ipv4 = ?plan.ipv4,
            ipv6 = ?plan.ipv6,
            "tun_device_ready"
        );
        Ok(device)
    } else {
        Err(DeviceError::BringUp(failures))
    }
}

fn configure_family<P: DevicePlatform>(
    platform: &P,
    device: &P::Device,
    ip: IpAddr,
    mtu: u16,
    existing: &[IpAddr],
) -> Result<(), DeviceError> {
    let family = AddressFamily::of(ip);
    if existing.contains(&ip) {
        debug!(ip = ?ip, "tun_address_present");
    } else {
        match platform.add_address(device, ip) {
            Ok(()) | Err(DeviceError::AddressAlreadyAssigned(_)) => {}
            Err(e) => {
                return Err(DeviceError::SetAddress {
                    family,
                    source: Box::new(e),
                })
            }
        }
    }
    platform
        .set_mtu(device, family, mtu)
        .map_err(|e| DeviceError::SetMtu {
            family,
            source: Box::new(e),
        })
}

async fn device_to_transport(device: &dyn PacketDevice, transport: &dyn PacketTransport) -> io::Result<()> {
    let mut buf = vec![0u8; DEVICE_READ_BUF];
    loop {
        let n = device.recv(&mut buf).await?;
        if n == 0 {
            continue;
        }
        transport.send_packet(Bytes::copy_from_slice(&buf[..n])).await?;
    }
}

async fn transport_to_device(device: &dyn PacketDevice, transport: &dyn PacketTransport) -> io::Result<()> {
    loop {
        let packet = transport.recv_packet().await?;
        device.send(&packet).await?;
    }
}

/// Pump packets in both directions until either side fails or `shutdown`
/// fires.
pub async fn run_bridge(
    device: Arc<dyn PacketDevice>,
    transport: Arc<dyn PacketTransport>,
    shutdown: CancellationToken,
) -> anyhow::Result<()> {
    info!(name = device.name(), mtu = transport.mtu(), "tun_bridge_started");
    let result = tokio::select! {
        _ = shutdown.cancelled() => Ok(()),
        res = device_to_transport(device.as_ref(), transport.as_ref()) => {
            res.with_context(|| format!("{} to transport pump stopped", device.name()))
        }
        res = transport_to_device(device.as_ref(), transport.as_ref()) => {
            res.with_context(|| format!("transport to {} pump stopped", device.name()))
        }
    };
    info!(name = device.name(), "tun_bridge_stopped");
    result
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;
    use std::time::Duration;

    use async_trait::async_trait;
    use tokio::sync::{mpsc, Mutex as AsyncMutex};

    use super::*;
    use crate::transport::memory;

    struct FakeDevice {
        name: String,
        inbound: AsyncMutex<mpsc::UnboundedReceiver<Vec<u8>>>,
        outbound: mpsc::UnboundedSender<Vec<u8>>,
    }

    #[async_trait]
    impl PacketDevice for FakeDevice {
        fn name(&self) -> &str {
            &self.name
        }

        async fn recv(&self, buf: &mut [u8]) -> io::Result<usize> {
            let packet = self
                .inbound
                .lock()
                .await
                .recv()
                .await
                .ok_or_else(|| io::Error::from(io::ErrorKind::UnexpectedEof))?;
            buf[..packet.len()].copy_from_slice(&packet);
            Ok(packet.len())
        }

        async fn send(&self, packet: &[u8]) -> io::Result<usize> {
            self.outbound
                .send(packet.to_vec())
                .map_err(|_| io::Error::from(io::ErrorKind::BrokenPipe))?;
            Ok(packet.len())
        }
    }

    fn fake_device(name: &str) -> (FakeDevice, mpsc::UnboundedSender<Vec<u8>>, mpsc::UnboundedReceiver<Vec<u8>>) {
        let (in_tx, in_rx) = mpsc::unbounded_channel();
        let (out_tx, out_rx) = mpsc::unbounded_channel();
        (
            FakeDevice {
                name: name.to_string(),
                inbound: AsyncMutex::new(in_rx),
                outbound: out_tx,
            },
            in_tx,
            out_rx,
        )
    }

    #[derive(Default)]
    struct ScriptedPlatform {
        present: Vec<IpAddr>,
        fail_create: bool,
        fail_address: Option<AddressFamily>,
        already_assigned: Option<AddressFamily>,
        calls: Mutex<Vec<String>>,
    }

    impl ScriptedPlatform {
        fn record(&self, call: String) {
            self.calls.lock().expect("calls").push(call);
        }

        fn calls(&self) -> Vec<String> {
            self.calls.lock().expect("calls").clone()
        }
    }

    impl DevicePlatform for ScriptedPlatform {
        type Device = FakeDevice;

        fn create(&self, name: &str, mtu: u16) -> Result<FakeDevice, DeviceError> {
            self.record(format!("create {name} {mtu}"));
            if self.fail_create {
                return Err(DeviceError::CreateFailed {
                    name: name.to_string(),
                    source: io::Error::from(io::ErrorKind::PermissionDenied),
                });
            }
            Ok(fake_device(name).0)
        }

        fn add_address(&self, _device: &FakeDevice, ip: IpAddr) -> Result<(), DeviceError> {
            self.record(format!("addr {ip}"));
            let family = AddressFamily::of(ip);
            if self.fail_address == Some(family) {
                return Err(DeviceError::PermissionDenied("RTM_NEWADDR".into()));
            }
            if self.already_assigned == Some(family) {
                return Err(DeviceError::AddressAlreadyAssigned(ip));
            }
            Ok(())
        }

        fn set_mtu(&self, _device: &FakeDevice, family: AddressFamily, mtu: u16) -> Result<(), DeviceError> {
            self.record(format!("mtu {family} {mtu}"));
            Ok(())
        }

        fn addresses(&self, _device: &FakeDevice) -> Result<Vec<IpAddr>, DeviceError> {
            Ok(self.present.clone())
        }
    }

    fn plan() -> BringUp {
        BringUp {
            name: "tunplane".into(),
            mtu: 1280,
            ipv4: Some(Ipv4Addr::new(172, 16, 0, 2)),
            ipv6: Some("fd00::2".parse().expect("v6")),
        }
    }

    #[test]
    fn ipv4_failure_still_configures_ipv6() {
        let platform = ScriptedPlatform {
            fail_address: Some(AddressFamily::Ipv4),
            ..Default::default()
        };
        let err = bring_up(&platform, &plan()).err().expect("IPv4 fails");
        assert_eq!(
            platform.calls(),
            vec![
                "create tunplane 1280",
                "addr 172.16.0.2",
                "addr fd00::2",
                "mtu IPv6 1280",
            ]
        );
        match err {
            DeviceError::BringUp(failures) => {
                assert_eq!(failures.len(), 1);
                assert!(matches!(
                    &failures[0],
                    DeviceError::SetAddress { family: AddressFamily::Ipv4, source }
                        if matches!(**source, DeviceError::PermissionDenied(_))
                ));
                assert!(failures[0].to_string().contains("failed to set IPv4 address"));
            }
            other => panic!("unexpected error {other}"),
        }
    }

    #[test]
    fn present_addresses_are_not_added_again() {
        let platform = ScriptedPlatform {
            present: vec![IpAddr::V4(Ipv4Addr::new(172, 16, 0, 2))],
            already_assigned: Some(AddressFamily::Ipv6),
            ..Default::default()
        };
        bring_up(&platform, &plan()).expect("bring up");
        assert_eq!(
            platform.calls(),
            vec![
                "create tunplane 1280",
                "mtu IPv4 1280",
                "addr fd00::2",
                "mtu IPv6 1280",
            ]
        );
    }

    #[test]
    fn creation_failure_is_fatal() {
        let platform = ScriptedPlatform {
            fail_create: true,
            ..Default::default()
        };
        let err = bring_up(&platform, &plan()).err().expect("create fails");
        assert!(matches!(err, DeviceError::CreateFailed { .. }));
        assert_eq!(platform.calls().len(), 1);
    }

    #[tokio::test]
    async fn bridge_moves_packets_both_ways() {
        let (device, to_device, mut from_device) = fake_device("tun-test");
        let (transport, mut peer) = memory::pair(1280);
        let shutdown = CancellationToken::new();
        let bridge = tokio::spawn(run_bridge(
            Arc::new(device),
            Arc::new(transport),
            shutdown.clone(),
        ));

        to_device.send(vec![0x45, 1, 2, 3]).expect("inject from app");
        let up = tokio::time::timeout(Duration::from_secs(2), peer.from_stack.recv())
            .await
            .expect("uplink in time")
            .expect("uplink open");
        assert_eq!(&up[..], &[0x45, 1, 2, 3]);

        peer.to_stack
            .send(Bytes::from_static(&[0x60, 9, 9]))
            .expect("inject from tunnel");
        let down = tokio::time::timeout(Duration::from_secs(2), from_device.recv())
            .await
            .expect("downlink in time")
            .expect("downlink open");
        assert_eq!(down, vec![0x60, 9, 9]);

        shutdown.cancel();
        tokio::time::timeout(Duration::from_secs(2), bridge)
            .await
            .expect("bridge stops")
            .expect("join")
            .expect("clean shutdown");
    }
}
