// Static exclude tables. Patterns are rsync filter patterns anchored at the
// transfer root; a trailing `/*` keeps the directory itself so the destination
// still has the mount point.

pub const RUNTIME: &[&str] = &[
    "/dev/*",
    "/proc/*",
    "/sys/*",
    "/tmp/*",
    "/run/*",
    "/mnt/*",
    "/media/*",
    "/lost+found",
    "/swapfile",
    "/swap.img",
    "/var/run/*",
    "/var/lock/*",
];

// Sockets, pid files and live runtime dirs of the container engine. Never
// useful on another host, whether or not engine state is copied.
pub const ENGINE_RUNTIME: &[&str] = &[
    "/var/run/docker.sock",
    "/var/run/docker.pid",
    "/var/run/docker/*",
    "/var/run/containerd/*",
    "/var/lib/docker/containers/*/mounts/*",
];

pub const BOOT: &[&str] = &[
    "/boot/*",
    "/lib/modules/*",
    "/usr/lib/modules/*",
    "/etc/fstab",
    "/etc/crypttab",
    "/etc/default/grub",
    "/etc/mdadm/mdadm.conf",
    "/etc/initramfs-tools/conf.d/resume",
];

pub const NETWORK_IDENTITY: &[&str] = &[
    "/etc/hostname",
    "/etc/hosts",
    "/etc/machine-id",
    "/var/lib/dbus/machine-id",
    "/etc/network/interfaces",
    "/etc/network/interfaces.d/*",
    "/etc/netplan/*",
    "/etc/systemd/network/*",
    "/etc/NetworkManager/system-connections/*",
    "/etc/resolv.conf",
    "/etc/cloud/*",
    "/var/lib/cloud/*",
];

pub const HOST_SSH_IDENTITY: &[&str] = &[
    "/etc/ssh/ssh_host_*",
    "/etc/ssh/sshd_config",
    "/etc/ssh/sshd_config.d/*",
];

pub const USER_AUTH: &[&str] = &[
    "/etc/passwd",
    "/etc/passwd-",
    "/etc/shadow",
    "/etc/shadow-",
    "/etc/group",
    "/etc/group-",
    "/etc/gshadow",
    "/etc/gshadow-",
    "/etc/sudoers",
    "/etc/sudoers.d/*",
    "/root/.ssh/*",
    "/home/*/.ssh/*",
];

pub const FIREWALL: &[&str] = &[
    "/etc/ufw/*",
    "/lib/ufw/*",
    "/etc/iptables/*",
    "/etc/nftables.conf",
    "/etc/firewalld/*",
];

pub const ENGINE_STATE: &[&str] = &["/var/lib/docker/*", "/var/lib/containerd/*"];

pub const CACHE_NOISE: &[&str] = &[
    "/var/cache/*",
    "/var/log/*",
    "/var/tmp/*",
    "/var/crash/*",
    "/var/lib/apt/lists/*",
    "/var/lib/systemd/coredump/*",
    "/root/.cache/*",
    "/home/*/.cache/*",
];
