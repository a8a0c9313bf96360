//! Network Fabric: host bridge, veth pairs, and a
//! persistent per-container network namespace. Host-side link management
//! goes through `rtnetlink`; namespace creation/entry goes through `nix`'s
//! raw `unshare`/`setns`/mount syscalls, since those affect only the
//! calling task and cannot be expressed through netlink.

use std::fs::OpenOptions;
use std::os::unix::io::RawFd;

use futures::TryStreamExt;
use ipnetwork::IpNetwork;
use nix::fcntl::{open, OFlag};
use nix::mount::{mount, MsFlags};
use nix::sched::{setns, unshare, CloneFlags};
use nix::sys::stat::Mode;
use nix::unistd::close;
use rand::Rng;
use rtnetlink::packet::rtnl::constants::{AF_BRIDGE, RTEXT_FILTER_BRVLAN};
use rtnetlink::packet::rtnl::link::nlas::Nla;
use rtnetlink::packet::IFF_UP;
use rtnetlink::{new_connection, Handle};

use crate::error::{GockerError, Result};
use crate::paths::{
    netns_file, GOCKER_BRIDGE_ADDRESS, GOCKER_BRIDGE_NAME, GOCKER_NETNS_PATH,
    GOCKER_NETWORK_ADDRESS,
};

fn net_err(context: impl Into<String>) -> impl FnOnce(rtnetlink::Error) -> GockerError {
    let context = context.into();
    move |e| GockerError::Network(format!("{context}: {e}"))
}

fn new_handle() -> Result<Handle> {
    let (connection, handle, _) =
        new_connection().map_err(|e| GockerError::Network(format!("open netlink socket: {e}")))?;
    tokio::spawn(connection);
    Ok(handle)
}

pub async fn is_bridge_up() -> Result<bool> {
    let handle = new_handle()?;
    let mut links = handle
        .link()
        .get()
        .set_filter_mask(AF_BRIDGE as u8, RTEXT_FILTER_BRVLAN)
        .execute();

    while let Some(msg) = links
        .try_next()
        .await
        .map_err(|e| GockerError::Network(format!("list links: {e}")))?
    {
        let up = msg.header.flags & IFF_UP != 0;
        for nla in msg.nlas {
            if let Nla::IfName(name) = nla {
                if name == GOCKER_BRIDGE_NAME && up {
                    return Ok(true);
                }
            }
        }
    }
    Ok(false)
}

async fn link_index(handle: &Handle, name: &str) -> Result<u32> {
    let mut links = handle.link().get().set_name_filter(name.to_string()).execute();
    match links
        .try_next()
        .await
        .map_err(net_err(format!("look up link {name}")))?
    {
        Some(link) => Ok(link.header.index),
        None => Err(GockerError::Network(format!("link not found: {name}"))),
    }
}

async fn set_link_up(handle: &Handle, name: &str) -> Result<()> {
    let index = link_index(handle, name).await?;
    handle
        .link()
        .set(index)
        .up()
        .execute()
        .await
        .map_err(net_err(format!("bring up {name}")))
}

/// Bridge bring-up (idempotent): creates `gocker0` with its fixed
/// address if it does not already exist.
pub async fn ensure_bridge() -> Result<()> {
    if is_bridge_up().await? {
        return Ok(());
    }

    let handle = new_handle()?;
    let mut existing = handle
        .link()
        .get()
        .set_name_filter(GOCKER_BRIDGE_NAME.to_string())
        .execute();
    if existing
        .try_next()
        .await
        .map_err(net_err("look up bridge"))?
        .is_some()
    {
        set_link_up(&handle, GOCKER_BRIDGE_NAME).await?;
        return Ok(());
    }

    handle
        .link()
        .add()
        .bridge(GOCKER_BRIDGE_NAME.to_string())
        .execute()
        .await
        .map_err(net_err("create bridge"))?;

    let index = link_index(&handle, GOCKER_BRIDGE_NAME).await?;
    let network: IpNetwork = GOCKER_NETWORK_ADDRESS
        .parse()
        .map_err(|e| GockerError::Network(format!("parse network address: {e}")))?;
    let bridge_ip: std::net::IpAddr = GOCKER_BRIDGE_ADDRESS
        .parse()
        .map_err(|e| GockerError::Network(format!("parse bridge address: {e}")))?;
    handle
        .address()
        .add(index, bridge_ip, network.prefix())
        .execute()
        .await
        .map_err(net_err("assign bridge address"))?;

    set_link_up(&handle, GOCKER_BRIDGE_NAME).await
}

fn veth_names(container_id: &str) -> (String, String) {
    let short = &container_id[..6.min(container_id.len())];
    (format!("veth0_{short}"), format!("veth1_{short}"))
}

fn random_mac() -> [u8; 6] {
    let mut mac = [0u8; 6];
    mac[0] = 0x02;
    mac[1] = 0x42;
    rand::thread_rng().fill(&mut mac[2..]);
    mac
}

/// Phase H (host namespace, synchronous in the driver process): create the
/// veth pair, enslave the host end to the bridge, bring it up.
pub async fn setup_veth_host(container_id: &str) -> Result<()> {
    let (host_side, peer_side) = veth_names(container_id);
    let handle = new_handle()?;

    handle
        .link()
        .add()
        .veth(host_side.clone(), peer_side.clone())
        .execute()
        .await
        .map_err(net_err("create veth pair"))?;

    // Locally-administered MAC on the peer (container-side) endpoint.
    let peer_index = link_index(&handle, &peer_side).await?;
    let mac = random_mac();
    handle
        .link()
        .set(peer_index)
        .address(mac.to_vec())
        .execute()
        .await
        .map_err(net_err("assign veth peer mac"))?;

    set_link_up(&handle, &host_side).await?;

    let bridge_index = link_index(&handle, GOCKER_BRIDGE_NAME).await?;
    let host_index = link_index(&handle, &host_side).await?;
    handle
        .link()
        .set(host_index)
        .master(bridge_index)
        .execute()
        .await
        .map_err(net_err("enslave veth to bridge"))
}

/// Phase N (`setup-netns` re-entry subcommand): unshare a fresh network
/// namespace and bind-mount it at `<netns>/<id>` so it persists without a
/// resident process.
pub fn setup_netns(container_id: &str) -> Result<()> {
    std::fs::create_dir_all(GOCKER_NETNS_PATH).map_err(|source| GockerError::Io {
        context: format!("create {GOCKER_NETNS_PATH}"),
        source,
    })?;

    let ns_path = netns_file(container_id);
    if ns_path.exists() {
        return Err(GockerError::ResourceCollision {
            path: ns_path,
            reason: "network namespace file already exists".to_string(),
        });
    }
    OpenOptions::new()
        .read(true)
        .write(true)
        .create_new(true)
        .open(&ns_path)
        .map_err(|source| GockerError::Io {
            context: format!("create netns file {}", ns_path.display()),
            source,
        })?;

    let original_ns_fd: RawFd = open("/proc/self/ns/net", OFlag::O_RDONLY, Mode::empty())
        .map_err(|source| GockerError::Kernel {
            context: "open current network namespace".to_string(),
            source,
        })?;

    unshare(CloneFlags::CLONE_NEWNET).map_err(|source| GockerError::Kernel {
        context: "unshare network namespace".to_string(),
        source,
    })?;

    mount(
        Some("/proc/self/ns/net"),
        &ns_path,
        None::<&str>,
        MsFlags::MS_BIND,
        None::<&str>,
    )
    .map_err(|source| GockerError::Kernel {
        context: format!("bind-mount netns onto {}", ns_path.display()),
        source,
    })?;

    setns(original_ns_fd, CloneFlags::CLONE_NEWNET).map_err(|source| GockerError::Kernel {
        context: "restore original network namespace".to_string(),
        source,
    })?;
    close(original_ns_fd).ok();
    Ok(())
}

fn open_netns_fd(container_id: &str) -> Result<RawFd> {
    let ns_path = netns_file(container_id);
    open(&ns_path, OFlag::O_RDONLY, Mode::empty()).map_err(|source| GockerError::Kernel {
        context: format!("open netns file {}", ns_path.display()),
        source,
    })
}

fn random_container_address() -> std::net::IpAddr {
    let mut rng = rand::thread_rng();
    let b2: u8 = rng.gen_range(0..=254);
    let b3: u8 = rng.gen_range(1..=254);
    format!("172.29.{b2}.{b3}").parse().expect("valid ipv4")
}

/// Phase V (`setup-veth` re-entry subcommand): move the peer endpoint into
/// the container's namespace, enter that namespace, and configure it.
pub async fn setup_veth_ns(container_id: &str) -> Result<()> {
    let (_host_side, peer_side) = veth_names(container_id);
    let ns_fd = open_netns_fd(container_id)?;

    {
        let handle = new_handle()?;
        let peer_index = link_index(&handle, &peer_side).await?;
        handle
            .link()
            .set(peer_index)
            .setns_by_fd(ns_fd)
            .execute()
            .await
            .map_err(net_err("move veth peer into container namespace"))?;
    }

    setns(ns_fd, CloneFlags::CLONE_NEWNET).map_err(|source| GockerError::Kernel {
        context: "enter container network namespace".to_string(),
        source,
    })?;
    close(ns_fd).ok();

    let handle = new_handle()?;
    let peer_index = link_index(&handle, &peer_side).await?;
    let address = random_container_address();
    let network: IpNetwork = GOCKER_NETWORK_ADDRESS.parse().expect("valid network");
    handle
        .address()
        .add(peer_index, address, network.prefix())
        .execute()
        .await
        .map_err(net_err("assign container address"))?;
    set_link_up(&handle, &peer_side).await?;

    let gateway: std::net::Ipv4Addr = GOCKER_BRIDGE_ADDRESS.parse().expect("valid ipv4");
    handle
        .route()
        .add()
        .v4()
        .destination_prefix("0.0.0.0".parse().expect("valid ipv4"), 0)
        .gateway(gateway)
        .execute()
        .await
        .map_err(net_err("install default route"))
}

/// Brings up the loopback interface with `127.0.0.1/32` inside the calling
/// task's current (already-entered) network namespace. Called from
/// `child-mode` as part of its ordered child startup.
pub async fn bring_up_loopback() -> Result<()> {
    let handle = new_handle()?;
    let index = link_index(&handle, "lo").await?;
    let addr: std::net::IpAddr = "127.0.0.1".parse().expect("valid ipv4");
    handle
        .address()
        .add(index, addr, 32)
        .execute()
        .await
        .map_err(net_err("assign loopback address"))?;
    set_link_up(&handle, "lo").await
}

/// Join (called by the supervised child): switch the current task's
/// network namespace to the container's persistent one.
pub fn join(container_id: &str) -> Result<()> {
    let fd = open_netns_fd(container_id)?;
    setns(fd, CloneFlags::CLONE_NEWNET).map_err(|source| GockerError::Kernel {
        context: "join container network namespace".to_string(),
        source,
    })?;
    close(fd).ok();
    Ok(())
}

/// Unmounts and removes the persistent namespace file during teardown.
pub fn delete_netns(container_id: &str) -> Result<()> {
    let ns_path = netns_file(container_id);
    if !ns_path.exists() {
        return Ok(());
    }
    nix::mount::umount(&ns_path).map_err(|source| GockerError::Teardown {
        context: format!("unmount netns file {}", ns_path.display()),
        source: std::io::Error::from_raw_os_error(source as i32),
    })?;
    std::fs::remove_file(&ns_path).map_err(|source| GockerError::Teardown {
        context: format!("remove netns file {}", ns_path.display()),
        source,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn veth_names_derive_from_container_id_prefix() {
        let (host, peer) = veth_names("abcdef123456789");
        assert_eq!(host, "veth0_abcdef");
        assert_eq!(peer, "veth1_abcdef");
    }

    #[test]
    fn random_mac_is_locally_administered() {
        let mac = random_mac();
        assert_eq!(mac[0], 0x02);
        assert_eq!(mac[1], 0x42);
    }

    #[test]
    fn random_container_address_is_within_bridge_subnet() {
        for _ in 0..20 {
            let addr = random_container_address();
            match addr {
                std::net::IpAddr::V4(v4) => assert_eq!(v4.octets()[0..2], [172, 29]),
                std::net::IpAddr::V6(_) => panic!("expected ipv4"),
            }
        }
    }
}
