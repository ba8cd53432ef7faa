//! Stack-wide configuration knobs. Values are defaults; everything here is
//! plain data so a build can retune it in one place.

/// Capacity of the central exchange queue.
pub const EXMSG_MSG_CNT: usize = 10;
/// Worker tick; the longest the dispatch loop sleeps between timer scans.
pub const EXMSG_TICK_MS: u32 = 50;

/// Payload bytes carried by one packet-buffer block.
pub const PKTBUF_BLK_SIZE: usize = 128;
/// Blocks in the shared block pool.
pub const PKTBUF_BLK_CNT: usize = 128;
/// Buffer headers in the shared buffer pool.
pub const PKTBUF_BUF_CNT: usize = 128;

pub const NETIF_HWADDR_SIZE: usize = 10;
pub const NETIF_NAME_SIZE: usize = 10;
pub const NETIF_RECV_BUFSIZE: usize = 50;
pub const NETIF_SEND_BUFSIZE: usize = 50;
pub const NETIF_MAX_CNT: usize = 10;

pub const ARP_CACHE_SIZE: usize = 50;
/// Cadence of the cache maintenance scan.
pub const ARP_TIMER_MS: u32 = 1000;
/// Scans a `WAITING` entry survives before a retry.
pub const ARP_WAITING_TMO: u32 = 3;
/// Request retries before pending buffers are dropped as unreachable.
pub const ARP_RETRY_CNT: u32 = 5;
/// Scans a `RESOLVED` entry lives without refresh.
pub const ARP_RESOLVED_TMO: u32 = 1200;
/// Pending buffers one unresolved entry may hold.
pub const ARP_PENDING_LIMIT: usize = 5;

pub const IPV4_FRAG_ARR_SIZE: usize = 10;
/// Cadence of the reassembly watchdog.
pub const IPV4_FRAG_SCAN_MS: u32 = 1000;
/// Watchdog scans an unfinished reassembly survives.
pub const IPV4_FRAG_TMO: u32 = 10;
pub const IPV4_TTL_DEFAULT: u8 = 64;

pub const ROUTE_MAX_CNT: usize = 20;

pub const SOCKET_MAX_CNT: usize = 10;
/// Datagrams a raw or UDP socket may hold unread.
pub const SOCK_RECVQ_MAX: usize = 50;
pub const RAW_MAXCNT: usize = 10;
pub const UDP_MAXCNT: usize = 10;
pub const TCP_MAXCNT: usize = 32;

pub const PORT_START: u16 = 1024;
pub const PORT_END: u16 = 65535;

/// Largest TCP segment payload the stack offers and accepts.
pub const TCP_MSS: usize = 1460;
/// Bytes in each of the per-connection send and receive rings.
pub const TCP_SBUF_SIZE: usize = 2048;
pub const TCP_RBUF_SIZE: usize = 2048;
/// Receive window advertised while the ring has room.
pub const TCP_DEFAULT_WIN: u16 = 1024;
/// One maximum segment lifetime; TIME_WAIT holds for twice this.
pub const TCP_MSL_MS: u32 = 5000;
