//! virtio-wayland channel device
//!
//! Inside a VM the host compositor is reached through a channel device that
//! hands out host-shared memory, host-backed pipes and a context fd carrying
//! the Wayland byte stream. The context fd speaks in ioctl transactions, so a
//! [`ContextPump`] bridges it to an ordinary unix socket the Wayland client
//! library can use.

use super::mmap::{AccessSync, Mmap};
use super::{Allocation, BufferBackend, BufferDesc, HostImport};
use anyhow::{bail, Context, Result};
use bytemuck::{Pod, Zeroable};
use log::{debug, info, trace};
use rustix::net::{
    AddressFamily, RecvAncillaryBuffer, RecvAncillaryMessage, RecvFlags, SendAncillaryBuffer,
    SendAncillaryMessage, SendFlags, SocketFlags, SocketType,
};
use std::fs::OpenOptions;
use std::io::{IoSlice, IoSliceMut};
use std::os::fd::{AsFd, AsRawFd, BorrowedFd, FromRawFd, OwnedFd};
use std::path::{Path, PathBuf};
use std::rc::Rc;

/// `_IOWR('w', 0x00, struct virtwl_ioctl_new)`
const VIRTWL_IOCTL_NEW: libc::c_ulong = 0xC030_7700;
/// `_IOW('w', 0x01, struct virtwl_ioctl_txn)`
const VIRTWL_IOCTL_SEND: libc::c_ulong = 0x4074_7701;
/// `_IOR('w', 0x02, struct virtwl_ioctl_txn)`
const VIRTWL_IOCTL_RECV: libc::c_ulong = 0x8074_7702;

const VIRTWL_IOCTL_NEW_CTX: u32 = 0;
const VIRTWL_IOCTL_NEW_ALLOC: u32 = 1;
const VIRTWL_IOCTL_NEW_PIPE_READ: u32 = 2;
const VIRTWL_IOCTL_NEW_DMABUF: u32 = 4;

/// Most fds a single transaction can carry
pub const MAX_TXN_FDS: usize = 28;

/// Size of the transaction buffer including its header
const TXN_BUFFER_SIZE: usize = 4096;

#[repr(C)]
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
struct IoctlNew {
    kind: u32,
    fd: i32,
    flags: u32,
    /// `size`, or `width height format stride0..2 offset0..2` for dma-bufs
    payload: [u32; 9],
}

impl IoctlNew {
    fn new(kind: u32) -> Self {
        Self {
            kind,
            fd: -1,
            ..Zeroable::zeroed()
        }
    }
}

#[repr(C)]
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
struct TxnHeader {
    fds: [i32; MAX_TXN_FDS],
    len: u32,
}

const TXN_HEADER_SIZE: usize = std::mem::size_of::<TxnHeader>();

/// An opened channel device
#[derive(Debug)]
pub struct ChannelDevice {
    fd: OwnedFd,
    path: PathBuf,
}

impl ChannelDevice {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(&path)
            .with_context(|| format!("could not open {}", path.display()))?;
        info!("🔌 Opened channel device {}", path.display());
        Ok(Self {
            fd: OwnedFd::from(file),
            path,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn create(&self, request: &mut IoctlNew) -> Result<OwnedFd> {
        // SAFETY: VIRTWL_IOCTL_NEW reads and writes one `IoctlNew`.
        let rv = unsafe {
            libc::ioctl(
                self.fd.as_raw_fd(),
                VIRTWL_IOCTL_NEW as _,
                request as *mut IoctlNew,
            )
        };
        if rv != 0 {
            return Err(std::io::Error::last_os_error())
                .with_context(|| format!("VIRTWL_IOCTL_NEW type {}", request.kind));
        }
        if request.fd < 0 {
            bail!("channel device returned no fd for type {}", request.kind);
        }
        // SAFETY: the kernel just handed us ownership of this descriptor.
        Ok(unsafe { OwnedFd::from_raw_fd(request.fd) })
    }

    /// Host-shared memory of `size` bytes
    pub fn alloc(&self, size: usize) -> Result<OwnedFd> {
        let mut request = IoctlNew::new(VIRTWL_IOCTL_NEW_ALLOC);
        request.payload[0] = u32::try_from(size).context("allocation too large")?;
        self.create(&mut request)
    }

    /// Host dma-buf; returns the fd and the row stride chosen by the host
    pub fn alloc_dmabuf(&self, width: u32, height: u32, drm_format: u32) -> Result<(OwnedFd, u32)> {
        let mut request = IoctlNew::new(VIRTWL_IOCTL_NEW_DMABUF);
        request.payload[0] = width;
        request.payload[1] = height;
        request.payload[2] = drm_format;
        let fd = self
            .create(&mut request)
            .context("virtwl dmabuf allocation failed")?;
        Ok((fd, request.payload[3]))
    }

    /// Read end of a host-backed pipe
    pub fn pipe_read(&self) -> Result<OwnedFd> {
        self.create(&mut IoctlNew::new(VIRTWL_IOCTL_NEW_PIPE_READ))
            .context("failed to create virtwl pipe")
    }

    /// New Wayland context on the host
    pub fn context(&self) -> Result<OwnedFd> {
        self.create(&mut IoctlNew::new(VIRTWL_IOCTL_NEW_CTX))
            .context("failed to create virtwl context")
    }
}

/// Output buffers allocated from the channel device
pub struct ChannelBackend {
    device: Rc<ChannelDevice>,
    dmabuf: bool,
}

impl ChannelBackend {
    pub fn new(device: Rc<ChannelDevice>, dmabuf: bool) -> Self {
        Self { device, dmabuf }
    }
}

impl BufferBackend for ChannelBackend {
    fn name(&self) -> &'static str {
        if self.dmabuf {
            "virtwl-dmabuf"
        } else {
            "virtwl"
        }
    }

    fn allocate(&mut self, desc: &BufferDesc) -> Result<Allocation> {
        let bpp = desc.format.bytes_per_pixel();
        if self.dmabuf {
            let fourcc = desc.format.fourcc() as u32;
            let (fd, stride) = self.device.alloc_dmabuf(desc.width, desc.height, fourcc)?;
            let size = stride as usize * desc.height as usize;
            let mmap = Mmap::new(fd.try_clone()?, size, 0, stride as usize, bpp, AccessSync::None)?;
            return Ok(Allocation {
                mmap,
                import: HostImport::Dmabuf {
                    fd,
                    stride,
                    offset: 0,
                    modifier: 0,
                },
            });
        }

        let size = desc.size();
        let fd = self.device.alloc(size)?;
        let mmap = Mmap::new(
            fd.try_clone()?,
            size,
            0,
            desc.stride as usize,
            bpp,
            AccessSync::None,
        )?;
        Ok(Allocation {
            mmap,
            import: HostImport::Shm {
                fd,
                size,
                stride: desc.stride,
            },
        })
    }
}

/// Encodes a transaction header followed by `data` into `buf`
fn encode_txn(buf: &mut [u8], fds: &[i32], data_len: usize) {
    let mut header = TxnHeader::zeroed();
    header.fds = [-1; MAX_TXN_FDS];
    header.fds[..fds.len()].copy_from_slice(fds);
    header.len = data_len as u32;
    buf[..TXN_HEADER_SIZE].copy_from_slice(bytemuck::bytes_of(&header));
}

fn decode_txn(buf: &[u8]) -> TxnHeader {
    bytemuck::pod_read_unaligned(&buf[..TXN_HEADER_SIZE])
}

/// Fds carried by a received transaction, up to the first unused slot
fn txn_fds(header: &TxnHeader) -> impl Iterator<Item = i32> + '_ {
    header.fds.iter().copied().take_while(|fd| *fd >= 0)
}

/// Shuttles bytes and fds between a context fd and a unix socket
pub struct ContextPump {
    context: OwnedFd,
    socket: OwnedFd,
}

impl ContextPump {
    /// Opens a context and returns the pump plus the socket end to hand to
    /// the Wayland client connection.
    pub fn connect(device: &ChannelDevice) -> Result<(Self, OwnedFd)> {
        let (ours, theirs) = rustix::net::socketpair(
            AddressFamily::UNIX,
            SocketType::STREAM,
            SocketFlags::CLOEXEC,
            None,
        )?;
        let context = device.context()?;
        debug!("🔁 Host connection runs over the channel context");
        Ok((
            Self {
                context,
                socket: ours,
            },
            theirs,
        ))
    }

    pub fn context_fd(&self) -> BorrowedFd<'_> {
        self.context.as_fd()
    }

    pub fn socket_fd(&self) -> BorrowedFd<'_> {
        self.socket.as_fd()
    }

    /// Moves one transaction from the context to the socket.
    ///
    /// Returns `false` once the context has gone away.
    pub fn pump_from_context(&self) -> Result<bool> {
        let mut buf = vec![0u8; TXN_BUFFER_SIZE];
        encode_txn(&mut buf, &[], TXN_BUFFER_SIZE - TXN_HEADER_SIZE);
        // SAFETY: the buffer holds a header followed by `len` bytes of space.
        let rv = unsafe {
            libc::ioctl(
                self.context.as_raw_fd(),
                VIRTWL_IOCTL_RECV as _,
                buf.as_mut_ptr(),
            )
        };
        if rv != 0 {
            debug!("Channel context closed: {}", std::io::Error::last_os_error());
            return Ok(false);
        }

        let header = decode_txn(&buf);
        // SAFETY: every non-negative slot is a fresh descriptor owned by us.
        let fds: Vec<OwnedFd> = txn_fds(&header)
            .map(|fd| unsafe { OwnedFd::from_raw_fd(fd) })
            .collect();
        let borrowed: Vec<BorrowedFd<'_>> = fds.iter().map(|fd| fd.as_fd()).collect();
        let len = (header.len as usize).min(TXN_BUFFER_SIZE - TXN_HEADER_SIZE);
        let data = &buf[TXN_HEADER_SIZE..TXN_HEADER_SIZE + len];

        let mut space = [0u8; rustix::cmsg_space!(ScmRights(MAX_TXN_FDS))];
        let mut control = SendAncillaryBuffer::new(&mut space);
        if !borrowed.is_empty() {
            control.push(SendAncillaryMessage::ScmRights(&borrowed));
        }
        let sent = rustix::net::sendmsg(
            &self.socket,
            &[IoSlice::new(data)],
            &mut control,
            SendFlags::NOSIGNAL,
        )?;
        trace!("channel → socket: {} bytes, {} fds", sent, fds.len());
        Ok(true)
    }

    /// Moves one message from the socket to the context.
    ///
    /// Returns `false` when the socket reached end of stream.
    pub fn pump_to_context(&self) -> Result<bool> {
        let mut buf = vec![0u8; TXN_BUFFER_SIZE];
        let mut space = [0u8; rustix::cmsg_space!(ScmRights(MAX_TXN_FDS))];
        let mut control = RecvAncillaryBuffer::new(&mut space);
        let received = rustix::net::recvmsg(
            &self.socket,
            &mut [IoSliceMut::new(&mut buf[TXN_HEADER_SIZE..])],
            &mut control,
            RecvFlags::CMSG_CLOEXEC,
        )?;
        if received.bytes == 0 {
            return Ok(false);
        }

        let mut fds: Vec<OwnedFd> = Vec::new();
        for message in control.drain() {
            if let RecvAncillaryMessage::ScmRights(rights) = message {
                fds.extend(rights);
            }
        }
        if fds.len() > MAX_TXN_FDS {
            bail!("message carries {} fds, channel limit is {}", fds.len(), MAX_TXN_FDS);
        }
        let raw: Vec<i32> = fds.iter().map(|fd| fd.as_raw_fd()).collect();
        encode_txn(&mut buf, &raw, received.bytes);

        // SAFETY: the buffer holds a header followed by `len` bytes of data.
        let rv = unsafe {
            libc::ioctl(
                self.context.as_raw_fd(),
                VIRTWL_IOCTL_SEND as _,
                buf.as_ptr(),
            )
        };
        if rv != 0 {
            return Err(std::io::Error::last_os_error()).context("VIRTWL_IOCTL_SEND");
        }
        trace!("socket → channel: {} bytes, {} fds", received.bytes, fds.len());
        Ok(true)
    }
}
