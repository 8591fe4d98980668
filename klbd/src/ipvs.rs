//! Driver for the kernel's IPVS table, speaking the legacy
//! `setsockopt` control interface of the `ip_vs` module. All
//! fixed-layout kernel structs stay inside this module; the rest of
//! the daemon only ever sees typed values.

use std::io;
use std::mem;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd};

use thiserror::Error;

use crate::director::{Destination, VirtualService};

// Command constants from <linux/ip_vs.h>.
const IP_VS_BASE_CTL: libc::c_int = 64 + 1024 + 64;
const IP_VS_SO_SET_ADD: libc::c_int = IP_VS_BASE_CTL + 2;
const IP_VS_SO_SET_DEL: libc::c_int = IP_VS_BASE_CTL + 4;
const IP_VS_SO_SET_FLUSH: libc::c_int = IP_VS_BASE_CTL + 5;
const IP_VS_SO_SET_ADDDEST: libc::c_int = IP_VS_BASE_CTL + 7;
const IP_VS_SO_SET_DELDEST: libc::c_int = IP_VS_BASE_CTL + 8;
const IP_VS_SO_SET_EDITDEST: libc::c_int = IP_VS_BASE_CTL + 9;
const IP_VS_SO_GET_INFO: libc::c_int = IP_VS_BASE_CTL + 1;

const IP_VS_SCHEDNAME_MAXLEN: usize = 16;

/// Masquerading (NAT) connection mode.
const IP_VS_CONN_F_MASQ: u32 = 0;

/// `struct ip_vs_service_user`. Address and port are in network byte
/// order, as the kernel expects.
#[repr(C)]
#[derive(Clone, Copy)]
struct IpVsServiceUser {
    protocol: u16,
    addr: u32,
    port: u16,
    fwmark: u32,
    sched_name: [u8; IP_VS_SCHEDNAME_MAXLEN],
    flags: u32,
    timeout: u32,
    netmask: u32,
}

/// `struct ip_vs_dest_user`.
#[repr(C)]
#[derive(Clone, Copy)]
struct IpVsDestUser {
    addr: u32,
    port: u16,
    conn_flags: u32,
    weight: i32,
    u_threshold: u32,
    l_threshold: u32,
}

/// The ADDDEST/EDITDEST/DELDEST payload: service record immediately
/// followed by destination record.
#[repr(C)]
struct IpVsDestCommand {
    service: IpVsServiceUser,
    dest: IpVsDestUser,
}

/// `struct ip_vs_getinfo`, returned by the capability probe.
#[repr(C)]
struct IpVsGetInfo {
    version: u32,
    size: u32,
    num_services: u32,
}

#[derive(Debug, Error)]
pub enum IpvsError {
    /// The kernel lacks the `ip_vs` module (CONFIG_IP_VS). Fatal at
    /// startup; never produced after `open()` succeeds.
    #[error("kernel does not support IPVS (CONFIG_IP_VS)")]
    NotSupported,

    #[error("{op} failed: {source}")]
    Syscall { op: &'static str, source: io::Error },
}

/// The operations a director drives against the kernel table. `Ipvs`
/// is the real implementation; tests substitute a recording fake.
pub trait IpvsTable {
    fn add_service(&self, service: &VirtualService) -> Result<(), IpvsError>;
    fn delete_service(&self, service: &VirtualService) -> Result<(), IpvsError>;
    fn add_destination(&self, service: &VirtualService, dest: &Destination)
        -> Result<(), IpvsError>;
    /// Updates a destination in place, preserving the kernel-side
    /// connection counters. Kept at the boundary even though the
    /// replace policy in the director never uses it.
    #[allow(dead_code)]
    fn edit_destination(&self, service: &VirtualService, dest: &Destination)
        -> Result<(), IpvsError>;
    fn delete_destination(&self, service: &VirtualService, dest: &Destination)
        -> Result<(), IpvsError>;
}

/// Handle on the IPVS control channel: a raw IPv4 socket, which
/// requires CAP_NET_ADMIN. All operations are synchronous local calls.
pub struct Ipvs {
    socket: OwnedFd,
}

impl Ipvs {
    /// Opens the control channel and probes for the `ip_vs` module.
    pub fn open() -> Result<Self, IpvsError> {
        let fd = unsafe { libc::socket(libc::AF_INET, libc::SOCK_RAW, libc::IPPROTO_RAW) };
        if fd < 0 {
            return Err(IpvsError::Syscall {
                op: "socket",
                source: io::Error::last_os_error(),
            });
        }
        let socket = unsafe { OwnedFd::from_raw_fd(fd) };

        let mut info = IpVsGetInfo {
            version: 0,
            size: 0,
            num_services: 0,
        };
        let mut len = mem::size_of::<IpVsGetInfo>() as libc::socklen_t;
        let rc = unsafe {
            libc::getsockopt(
                socket.as_raw_fd(),
                libc::IPPROTO_IP,
                IP_VS_SO_GET_INFO,
                &mut info as *mut IpVsGetInfo as *mut libc::c_void,
                &mut len,
            )
        };
        if rc < 0 {
            let err = io::Error::last_os_error();
            return Err(if err.raw_os_error() == Some(libc::ENOPROTOOPT) {
                IpvsError::NotSupported
            } else {
                IpvsError::Syscall {
                    op: "IP_VS_SO_GET_INFO",
                    source: err,
                }
            });
        }

        tracing::debug!(
            "IPVS version {}.{}.{}, connection table size {}",
            (info.version >> 16) & 0xff,
            (info.version >> 8) & 0xff,
            info.version & 0xff,
            info.size,
        );

        Ok(Self { socket })
    }

    /// Removes every entry from the kernel table, clearing state left
    /// by a previous (possibly crashed) instance.
    pub fn flush(&self) -> Result<(), IpvsError> {
        let rc = unsafe {
            libc::setsockopt(
                self.socket.as_raw_fd(),
                libc::IPPROTO_IP,
                IP_VS_SO_SET_FLUSH,
                std::ptr::null(),
                0,
            )
        };
        if rc < 0 {
            return Err(IpvsError::Syscall {
                op: "IP_VS_SO_SET_FLUSH",
                source: io::Error::last_os_error(),
            });
        }
        Ok(())
    }

    fn set<P>(&self, op: &'static str, cmd: libc::c_int, payload: &P) -> Result<(), IpvsError> {
        let rc = unsafe {
            libc::setsockopt(
                self.socket.as_raw_fd(),
                libc::IPPROTO_IP,
                cmd,
                payload as *const P as *const libc::c_void,
                mem::size_of::<P>() as libc::socklen_t,
            )
        };
        if rc < 0 {
            return Err(IpvsError::Syscall {
                op,
                source: io::Error::last_os_error(),
            });
        }
        Ok(())
    }

    fn dest_command(service: &VirtualService, dest: &Destination) -> IpVsDestCommand {
        IpVsDestCommand {
            service: service_user(service),
            dest: dest_user(dest),
        }
    }
}

impl IpvsTable for Ipvs {
    fn add_service(&self, service: &VirtualService) -> Result<(), IpvsError> {
        self.set("IP_VS_SO_SET_ADD", IP_VS_SO_SET_ADD, &service_user(service))
    }

    fn delete_service(&self, service: &VirtualService) -> Result<(), IpvsError> {
        self.set("IP_VS_SO_SET_DEL", IP_VS_SO_SET_DEL, &service_user(service))
    }

    fn add_destination(
        &self,
        service: &VirtualService,
        dest: &Destination,
    ) -> Result<(), IpvsError> {
        self.set(
            "IP_VS_SO_SET_ADDDEST",
            IP_VS_SO_SET_ADDDEST,
            &Self::dest_command(service, dest),
        )
    }

    fn edit_destination(
        &self,
        service: &VirtualService,
        dest: &Destination,
    ) -> Result<(), IpvsError> {
        self.set(
            "IP_VS_SO_SET_EDITDEST",
            IP_VS_SO_SET_EDITDEST,
            &Self::dest_command(service, dest),
        )
    }

    fn delete_destination(
        &self,
        service: &VirtualService,
        dest: &Destination,
    ) -> Result<(), IpvsError> {
        self.set(
            "IP_VS_SO_SET_DELDEST",
            IP_VS_SO_SET_DELDEST,
            &Self::dest_command(service, dest),
        )
    }
}

fn service_user(service: &VirtualService) -> IpVsServiceUser {
    // Truncated to 15 bytes; the buffer stays NUL-terminated.
    let mut sched_name = [0u8; IP_VS_SCHEDNAME_MAXLEN];
    let sched = service.scheduler.as_bytes();
    let n = sched.len().min(IP_VS_SCHEDNAME_MAXLEN - 1);
    sched_name[..n].copy_from_slice(&sched[..n]);

    IpVsServiceUser {
        protocol: libc::IPPROTO_TCP as u16,
        addr: u32::from_ne_bytes(service.bind.ip().octets()),
        port: service.bind.port().to_be(),
        fwmark: 0,
        sched_name,
        flags: 0,
        timeout: 0,
        netmask: !0,
    }
}

fn dest_user(dest: &Destination) -> IpVsDestUser {
    IpVsDestUser {
        addr: u32::from_ne_bytes(dest.addr.ip().octets()),
        port: dest.addr.port().to_be(),
        conn_flags: IP_VS_CONN_F_MASQ,
        weight: 1,
        u_threshold: 0,
        l_threshold: 0,
    }
}
