//! 栈切换原语
//!
//! 运行时中唯一直接读写栈指针的代码。每个目标架构一份实现：
//! 把被调用者保存寄存器压到当前栈上，把栈指针写入 `save`，
//! 换到 `next_sp`，在新栈上调用切换后钩子，最后恢复目标的寄存器并返回。
//!
//! 新微线程的初始栈帧由 `init_stack` 伪造成"刚被切走"的样子，
//! 第一次切入时 `ret` 落到跳板，跳板再调用入口函数。

/// 切换后钩子：已经在新栈上运行，但目标寄存器尚未恢复
pub(crate) type SwitchHook = unsafe extern "C" fn(arg: *mut u8);

/// 微线程入口，永不返回
pub(crate) type EntryFn = unsafe extern "C" fn(arg: *mut u8) -> !;

pub(crate) use imp::{init_stack, switch_stack};

#[cfg(target_arch = "x86_64")]
mod imp {
    use std::arch::naked_asm;

    use super::{EntryFn, SwitchHook};

    /// 保存区：MXCSR/x87 控制字、r15..rbp、返回地址
    const FRAME_WORDS: usize = 8;
    /// MXCSR = 0x1F80，x87 控制字 = 0x037F（两者的上电默认值）
    const DEFAULT_FP_CONTROL: u64 = 0x0000_037F_0000_1F80;

    /// 保存当前上下文并切换到 `next_sp`
    ///
    /// # Safety
    ///
    /// `save` 必须指向调用方微线程的栈指针槽；`next_sp` 必须是由本函数
    /// 保存、或由 `init_stack` 构造、且尚未被恢复过的栈指针。
    #[unsafe(naked)]
    pub(crate) unsafe extern "C" fn switch_stack(
        _save: *mut usize,
        _next_sp: usize,
        _arg: *mut u8,
        _hook: SwitchHook,
    ) {
        naked_asm!(
            "push rbp",
            "push rbx",
            "push r12",
            "push r13",
            "push r14",
            "push r15",
            "sub rsp, 8",
            "stmxcsr dword ptr [rsp]",
            "fnstcw word ptr [rsp + 4]",
            "mov [rdi], rsp",
            "mov rsp, rsi",
            "mov rdi, rdx",
            "call rcx",
            "ldmxcsr dword ptr [rsp]",
            "fldcw word ptr [rsp + 4]",
            "add rsp, 8",
            "pop r15",
            "pop r14",
            "pop r13",
            "pop r12",
            "pop rbx",
            "pop rbp",
            "ret",
        )
    }

    /// 入口跳板：r12 = 参数，r13 = 入口函数
    #[unsafe(naked)]
    unsafe extern "C" fn trampoline() {
        naked_asm!("mov rdi, r12", "call r13", "ud2")
    }

    /// 在 `top` 之下构造初始栈帧，返回可交给 `switch_stack` 的栈指针
    ///
    /// # Safety
    ///
    /// `top` 必须是一段可写栈内存的高端地址，下方至少有 `(FRAME_WORDS + 2) * 8` 字节。
    pub(crate) unsafe fn init_stack(top: usize, entry: EntryFn, arg: *mut u8) -> usize {
        // 恢复后 rsp = sp + 64，调用入口前必须 16 字节对齐
        let sp = (top & !15) - (FRAME_WORDS + 2) * 8;
        let frame = sp as *mut u64;
        unsafe {
            frame.write(DEFAULT_FP_CONTROL);
            frame.add(1).write(0); // r15
            frame.add(2).write(0); // r14
            frame.add(3).write(entry as usize as u64); // r13
            frame.add(4).write(arg as usize as u64); // r12
            frame.add(5).write(0); // rbx
            frame.add(6).write(0); // rbp
            frame.add(7).write(trampoline as *const () as usize as u64);
        }
        sp
    }
}

#[cfg(target_arch = "aarch64")]
mod imp {
    use std::arch::naked_asm;

    use super::{EntryFn, SwitchHook};

    /// 保存区：x19-x28、x29/x30、d8-d15，共 20 个字
    const FRAME_WORDS: usize = 20;

    /// 保存当前上下文并切换到 `next_sp`
    ///
    /// # Safety
    ///
    /// `save` 必须指向调用方微线程的栈指针槽；`next_sp` 必须是由本函数
    /// 保存、或由 `init_stack` 构造、且尚未被恢复过的栈指针。
    #[unsafe(naked)]
    pub(crate) unsafe extern "C" fn switch_stack(
        _save: *mut usize,
        _next_sp: usize,
        _arg: *mut u8,
        _hook: SwitchHook,
    ) {
        naked_asm!(
            "sub sp, sp, #160",
            "stp x19, x20, [sp, #0]",
            "stp x21, x22, [sp, #16]",
            "stp x23, x24, [sp, #32]",
            "stp x25, x26, [sp, #48]",
            "stp x27, x28, [sp, #64]",
            "stp x29, x30, [sp, #80]",
            "stp d8, d9, [sp, #96]",
            "stp d10, d11, [sp, #112]",
            "stp d12, d13, [sp, #128]",
            "stp d14, d15, [sp, #144]",
            "mov x9, sp",
            "str x9, [x0]",
            "mov sp, x1",
            "mov x0, x2",
            "blr x3",
            "ldp d14, d15, [sp, #144]",
            "ldp d12, d13, [sp, #128]",
            "ldp d10, d11, [sp, #112]",
            "ldp d8, d9, [sp, #96]",
            "ldp x29, x30, [sp, #80]",
            "ldp x27, x28, [sp, #64]",
            "ldp x25, x26, [sp, #48]",
            "ldp x23, x24, [sp, #32]",
            "ldp x21, x22, [sp, #16]",
            "ldp x19, x20, [sp, #0]",
            "add sp, sp, #160",
            "ret",
        )
    }

    /// 入口跳板：x19 = 参数，x20 = 入口函数
    #[unsafe(naked)]
    unsafe extern "C" fn trampoline() {
        naked_asm!("mov x0, x19", "blr x20", "brk #0x1")
    }

    /// 在 `top` 之下构造初始栈帧，返回可交给 `switch_stack` 的栈指针
    ///
    /// # Safety
    ///
    /// `top` 必须是一段可写栈内存的高端地址，下方至少有 `(FRAME_WORDS + 2) * 8` 字节。
    pub(crate) unsafe fn init_stack(top: usize, entry: EntryFn, arg: *mut u8) -> usize {
        let sp = (top & !15) - (FRAME_WORDS + 2) * 8;
        let frame = sp as *mut u64;
        unsafe {
            for i in 0..FRAME_WORDS {
                frame.add(i).write(0);
            }
            frame.write(arg as usize as u64); // x19
            frame.add(1).write(entry as usize as u64); // x20
            frame.add(11).write(trampoline as *const () as usize as u64); // x30
        }
        sp
    }
}

#[cfg(not(any(target_arch = "x86_64", target_arch = "aarch64")))]
compile_error!("uthreads supports only x86_64 and aarch64");
