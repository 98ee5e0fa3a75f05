const KB: usize = 1024;
const MB: usize = 1024 * KB;

/// 一个页大小的 bit 数
pub const PAGE_SIZE_BITS: usize = 12;
/// 页大小
pub const PAGE_SIZE: usize = 1 << PAGE_SIZE_BITS;

/// 块设备的扇区大小
pub const SECTOR_SIZE: usize = 512;
/// 一个交换槽占据的连续扇区数
pub const SECTORS_PER_PAGE: usize = PAGE_SIZE / SECTOR_SIZE;

/// 用户栈顶，用户地址空间的末端
pub const USER_STACK_TOP: usize = 0xC000_0000;
/// 用户栈最多能增长到的大小
pub const MAX_STACK_SIZE: usize = 8 * MB;
/// 低于栈指针但仍视为栈访问的距离（`PUSHA` 一次压入 32 字节）
pub const STACK_FAULT_MARGIN: usize = 32;

/// 可供用户页使用的物理页帧数
pub const USER_FRAMES: usize = 256;

const _: () = assert!(PAGE_SIZE % SECTOR_SIZE == 0);
const _: () = assert!(USER_STACK_TOP % PAGE_SIZE == 0);
