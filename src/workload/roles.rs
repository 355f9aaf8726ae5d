//! The fixed table of processes run by every storage pod.
//!
//! Role names, port numbers and mount paths are part of the operational
//! contract with the rest of the deployment and must not change silently.

use crate::resources::ImageSelector;

pub const ACCOUNT_SERVER_PORT: i32 = 6202;
pub const CONTAINER_SERVER_PORT: i32 = 6201;
pub const OBJECT_SERVER_PORT: i32 = 6200;
pub const RSYNC_PORT: i32 = 873;
pub const MEMCACHED_PORT: i32 = 11211;

/// Numeric identity of the swift user inside the images
pub const RUN_AS_USER: i64 = 42445;

/// Lowest port a process may bind without extra privileges, so rsync can keep 873
pub const UNPRIVILEGED_PORT_START: i32 = RSYNC_PORT;

/// A named container port
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct NamedPort {
    pub name: &'static str,
    pub number: i32,
}

/// Which volumes a role gets mounted
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Mounts {
    /// The persistent claim plus all configuration volumes
    Storage,
    /// Nothing at all
    None,
}

/// A single process of a storage pod
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Role {
    pub name: &'static str,
    pub image: ImageSelector,
    pub command: &'static [&'static str],
    pub port: Option<NamedPort>,
    pub mounts: Mounts,
}

macro_rules! swift_role {
    ($name:literal, $image:ident, $config:literal) => {
        swift_role!($name, $image, $config, None)
    };
    ($name:literal, $image:ident, $config:literal, $port:expr) => {
        Role {
            name: $name,
            image: ImageSelector::$image,
            command: &[
                concat!("/usr/bin/swift-", $name),
                concat!("/etc/swift/", $config),
                "-v",
            ],
            port: $port,
            mounts: Mounts::Storage,
        }
    };
}

/// Stages the default configuration and the rings into the merged config directory.
pub const INIT_ROLES: &[Role] = &[Role {
    name: "swift-init",
    image: ImageSelector::Account,
    command: &[
        "/bin/sh",
        "-c",
        "cp -t /etc/swift/ /var/lib/config-data/default/* /var/lib/config-data/rings/*",
    ],
    port: None,
    mounts: Mounts::Storage,
}];

pub const SERVER_ROLES: &[Role] = &[
    swift_role!(
        "account-server",
        Account,
        "account-server.conf",
        Some(NamedPort { name: "account", number: ACCOUNT_SERVER_PORT })
    ),
    swift_role!("account-replicator", Account, "account-server.conf"),
    swift_role!("account-auditor", Account, "account-server.conf"),
    swift_role!("account-reaper", Account, "account-server.conf"),
    swift_role!(
        "container-server",
        Container,
        "container-server.conf",
        Some(NamedPort { name: "container", number: CONTAINER_SERVER_PORT })
    ),
    swift_role!("container-replicator", Container, "container-server.conf"),
    swift_role!("container-auditor", Container, "container-server.conf"),
    swift_role!("container-updater", Container, "container-server.conf"),
    swift_role!(
        "object-server",
        Object,
        "object-server.conf",
        Some(NamedPort { name: "object", number: OBJECT_SERVER_PORT })
    ),
    swift_role!("object-replicator", Object, "object-server.conf"),
    swift_role!("object-auditor", Object, "object-server.conf"),
    swift_role!("object-updater", Object, "object-server.conf"),
    swift_role!("object-expirer", Proxy, "object-expirer.conf"),
    Role {
        name: "rsync",
        image: ImageSelector::Object,
        command: &[
            "/usr/bin/rsync",
            "--daemon",
            "--no-detach",
            "--config=/etc/swift/rsyncd.conf",
            "--log-file=/dev/stdout",
        ],
        port: Some(NamedPort { name: "rsync", number: RSYNC_PORT }),
        mounts: Mounts::Storage,
    },
    Role {
        name: "memcached",
        image: ImageSelector::Memcached,
        command: &["/usr/bin/memcached", "-p", "11211", "-u", "memcached"],
        port: Some(NamedPort { name: "memcached", number: MEMCACHED_PORT }),
        mounts: Mounts::None,
    },
];
