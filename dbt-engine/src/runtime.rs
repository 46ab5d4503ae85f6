//! 翻译驱动
//!
//! [`Runtime`] 持有代码缓存、翻译缓存和块描述符表，对外提供
//! [`Runtime::lookup_or_translate`]：命中直接返回宿主地址，未命中时按基本块
//! 翻译、写入代码缓存、登记并与已翻译的后继块链接。
//!
//! 生成的代码总是在块尾写回下一条 PC 并 `ret` 到调度器，链接信息只记录在
//! 块描述符中，供调度器跳过查表使用。无法翻译的指令交给 [`Runtime::step`]
//! 解释执行。
//!
//! 在 x86-64 宿主上，[`Runtime::enter`] 经由入口桩执行块：入口桩把保存区中的
//! v0..v15 装入 xmm0..xmm15，以 RDI 指向保存区调用块，返回后再写回。
//! [`Runtime::run`] 在此之上交替执行本地块和解释器。
//!
//! 代码缓存重置与"分配、写入、登记"之间由 `gate` 读写锁隔开：登记和执行
//! 持读锁，重置持写锁，已登记的宿主地址在读锁期间不会被复用。

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use log::{debug, info, warn};
use parking_lot::{Mutex, RwLock};
use serde::Serialize;

use dbt_core::save_area::{offsets, vector_offset};
use dbt_core::{Config, CpuContext, EngineConfig, GuestAddr, GuestMemory, HostAddr, MemoryFault, Protection};
#[cfg(target_arch = "x86_64")]
use dbt_core::{BlockExit, RoundingMode, SaveArea, restore, save};
use dbt_mem::{CHAIN_SLOTS, CodeBlock, CodeCache, CodeCacheError, CodeCacheInfo};

use crate::decode::{Control, DispatchError, Dispatcher, EmitOptions, Handled, emit_exit};
use crate::emit::x86::{Alu, Gpr, Mem, Width};
use crate::emit::{EmitError, Emitter, HOST_VECTOR_REGS, HostFeatures};
use crate::error::{EngineError, EngineResult};
use crate::tcache::{TranslationCache, TranslationCacheStats};

/// 块尾退出桩需要的最大字节数
const EXIT_STUB_BYTES: usize = 32;

const TRAMPOLINE_BYTES: usize = 512;

/// 入口桩：(保存区, 块地址)
#[cfg(target_arch = "x86_64")]
type EntryFn = unsafe extern "sysv64" fn(*mut u8, HostAddr);

/// 运行时统计
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct RuntimeStats {
    pub translation_cache: TranslationCacheStats,
    pub code_cache: CodeCacheInfo,
    pub host_features: HostFeatures,
    pub blocks_translated: u64,
    pub guest_instructions: u64,
    pub interpreted_instructions: u64,
    /// 块中途遇到无法翻译的指令而提前结束的次数
    pub fallbacks: u64,
    pub cache_resets: u64,
    pub blocks_chained: u64,
    pub vector_alias_hits: u64,
    /// 在宿主上执行的块数
    pub native_blocks: u64,
}

#[derive(Debug, Default)]
struct Counters {
    blocks_translated: AtomicU64,
    guest_instructions: AtomicU64,
    interpreted_instructions: AtomicU64,
    fallbacks: AtomicU64,
    cache_resets: AtomicU64,
    blocks_chained: AtomicU64,
    native_blocks: AtomicU64,
}

/// 块描述符及其翻译时已知的后继
#[derive(Debug, Clone)]
struct BlockRecord {
    block: CodeBlock,
    /// 覆盖的客户机字节数
    guest_len: u64,
    successors: [Option<GuestAddr>; CHAIN_SLOTS],
}

/// 一次块翻译的结果
#[derive(Debug)]
struct Translation {
    code: Vec<u8>,
    guest_insns: usize,
    successors: [Option<GuestAddr>; CHAIN_SLOTS],
}

pub struct Runtime {
    config: EngineConfig,
    code_cache: CodeCache,
    tcache: TranslationCache,
    dispatcher: Dispatcher,
    options: EmitOptions,
    memory: Arc<dyn GuestMemory>,
    blocks: RwLock<HashMap<GuestAddr, BlockRecord>>,
    /// 重置持写锁；登记和执行持读锁
    gate: RwLock<()>,
    /// 入口桩地址，首次执行时写入代码缓存，重置后清空
    trampoline: Mutex<Option<HostAddr>>,
    counters: Counters,
}

impl std::fmt::Debug for Runtime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Runtime")
            .field("code_cache", &self.code_cache)
            .field("tcache", &self.tcache)
            .field("features", &self.options.features)
            .finish()
    }
}

impl Runtime {
    /// 按配置映射代码缓存并检测宿主机特性
    pub fn new(config: EngineConfig, memory: Arc<dyn GuestMemory>) -> EngineResult<Self> {
        config.validate()?;
        let code_cache = CodeCache::init(&config.code_cache)?;
        Self::with_code_cache(config, code_cache, memory, HostFeatures::detect())
    }

    /// 使用已创建的代码缓存和指定的宿主机特性
    pub fn with_code_cache(
        config: EngineConfig,
        code_cache: CodeCache,
        memory: Arc<dyn GuestMemory>,
        features: HostFeatures,
    ) -> EngineResult<Self> {
        config.validate()?;
        let tcache = TranslationCache::new(config.translation_cache.entries)?;
        let options = EmitOptions::new(features, config.translation.vector_alias_policy);
        info!("runtime ready: {}, host {features:?}", config.summary());
        Ok(Self {
            config,
            code_cache,
            tcache,
            dispatcher: Dispatcher::new(),
            options,
            memory,
            blocks: RwLock::new(HashMap::new()),
            gate: RwLock::new(()),
            trampoline: Mutex::new(None),
            counters: Counters::default(),
        })
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn code_cache(&self) -> &CodeCache {
        &self.code_cache
    }

    pub fn translation_cache(&self) -> &TranslationCache {
        &self.tcache
    }

    pub fn features(&self) -> HostFeatures {
        self.options.features
    }

    /// `guest_pc` 处块的描述符
    pub fn block(&self, guest_pc: GuestAddr) -> Option<CodeBlock> {
        self.blocks.read().get(&guest_pc).map(|r| r.block.clone())
    }

    /// 返回 `guest_pc` 的宿主代码地址，未翻译时先翻译
    ///
    /// 第一条指令就无法翻译时返回 [`EngineError::Untranslatable`]，调用方应
    /// 用 [`Runtime::step`] 解释执行该指令后再查找下一条。
    pub fn lookup_or_translate(&self, guest_pc: GuestAddr) -> EngineResult<HostAddr> {
        if let Some(host) = self.tcache.lookup(guest_pc) {
            return Ok(host);
        }

        let Some(_claim) = self.tcache.try_claim(guest_pc) else {
            return Err(EngineError::Busy { pc: guest_pc });
        };
        // 等待声明期间其他线程可能已经完成翻译
        if let Some(entry) = self.tcache.peek(guest_pc) {
            return Ok(entry.host);
        }

        let translation = self.translate(guest_pc)?;
        let host = match self.install_and_register(guest_pc, &translation) {
            Err(EngineError::CodeCache(CodeCacheError::Full { requested, free })) => {
                warn!("code cache full ({requested} bytes requested, {free} free), flushing all translations");
                self.reset_caches()?;
                self.install_and_register(guest_pc, &translation)?
            }
            other => other?,
        };

        self.counters.blocks_translated.fetch_add(1, Ordering::Relaxed);
        self.counters
            .guest_instructions
            .fetch_add(translation.guest_insns as u64, Ordering::Relaxed);
        debug!(
            "translated block {guest_pc:#x}: {} insns -> {} bytes at {host:#x}",
            translation.guest_insns,
            translation.code.len()
        );
        Ok(host)
    }

    /// 从 `pc` 开始逐条发射，直到控制转移、指令数或字节数上限、无效地址，
    /// 或无法翻译的指令
    fn translate(&self, pc: GuestAddr) -> EngineResult<Translation> {
        let limits = &self.config.translation;
        let mut em = Emitter::new(limits.max_block_bytes.saturating_sub(EXIT_STUB_BYTES));
        let mut next = pc;
        let mut guest_insns = 0;

        // 块没有以控制转移结束时，`exit` 是退出桩要写回的下一条 PC
        let (successors, exit) = loop {
            if guest_insns == limits.max_block_insns || !self.memory.is_valid(next, 4) {
                if guest_insns == 0 {
                    return Err(MemoryFault::Unmapped { addr: pc, len: 4 }.into());
                }
                break ([Some(next), None], Some(next));
            }

            let encoding = match self.memory.fetch(next) {
                Ok(encoding) => encoding,
                Err(fault) if guest_insns == 0 => return Err(fault.into()),
                Err(_) => break ([Some(next), None], Some(next)),
            };

            match self.dispatcher.emit(encoding, next, &mut em, &self.options) {
                Ok(Handled { control, .. }) => {
                    guest_insns += 1;
                    match control {
                        Control::Continue => next = next.wrapping_add(4),
                        Control::Direct { taken, fallthrough } => break ([Some(taken), fallthrough], None),
                        Control::Indirect => break ([None, None], None),
                    }
                }
                Err(err) if guest_insns == 0 => return Err(untranslatable(pc, err)),
                Err(err) => {
                    debug!("block {pc:#x} ends before {next:#x}: {err}");
                    self.counters.fallbacks.fetch_add(1, Ordering::Relaxed);
                    break ([Some(next), None], Some(next));
                }
            }
        };

        let mut code = em.into_bytes();
        if let Some(next) = exit {
            let mut stub = Emitter::new(EXIT_STUB_BYTES);
            emit_exit(&mut stub, next)?;
            code.extend_from_slice(stub.bytes());
        }
        Ok(Translation {
            code,
            guest_insns,
            successors,
        })
    }

    /// 在读锁内写入代码并登记；缓存满时原样返回错误，由调用方放开读锁后重置
    fn install_and_register(&self, guest_pc: GuestAddr, translation: &Translation) -> EngineResult<HostAddr> {
        let _gate = self.gate.read();
        let host = self.install(&translation.code)?;
        self.register(guest_pc, host, translation)?;
        Ok(host)
    }

    /// 分配、写入、刷新并设为可执行
    fn install(&self, code: &[u8]) -> EngineResult<HostAddr> {
        let host = self.code_cache.alloc(code.len())?;
        self.code_cache.write(host, code)?;
        self.code_cache.flush_icache(Some((host, code.len())))?;
        self.code_cache.protect(host, code.len(), Protection::ReadExecute)?;
        Ok(host)
    }

    /// 登记描述符和翻译缓存条目，并与已翻译的前驱、后继互相链接
    fn register(&self, guest_pc: GuestAddr, host: HostAddr, translation: &Translation) -> EngineResult<()> {
        let mut block = self.code_cache.init_block(guest_pc, host, translation.code.len())?;
        let mut blocks = self.blocks.write();
        let mut chained = 0;

        for (slot, successor) in translation.successors.iter().enumerate() {
            let target = match *successor {
                Some(pc) if pc == guest_pc => Some(block.clone()),
                Some(pc) => blocks.get(&pc).map(|r| r.block.clone()),
                None => None,
            };
            if let Some(target) = target.filter(CodeBlock::is_valid) {
                self.code_cache.chain(&mut block, &target, slot)?;
                chained += 1;
            }
        }

        for record in blocks.values_mut() {
            if !record.block.is_valid() {
                continue;
            }
            for slot in 0..CHAIN_SLOTS {
                if record.successors[slot] == Some(guest_pc) {
                    self.code_cache.chain(&mut record.block, &block, slot)?;
                    chained += 1;
                }
            }
        }

        let size = translation.guest_insns * 4;
        if let Some(evicted) = self.tcache.insert(guest_pc, host, size)? {
            debug!("tcache evicted {:#x} for {guest_pc:#x}", evicted.guest);
        }
        blocks.insert(
            guest_pc,
            BlockRecord {
                block,
                guest_len: size as u64,
                successors: translation.successors,
            },
        );
        self.counters.blocks_chained.fetch_add(chained, Ordering::Relaxed);
        Ok(())
    }

    /// 清空代码缓存、翻译缓存和块描述符
    ///
    /// 等待正在登记或执行的块结束后才会清空。
    pub fn reset_caches(&self) -> EngineResult<()> {
        let _gate = self.gate.write();
        self.code_cache.reset()?;
        self.tcache.invalidate_all();
        self.blocks.write().clear();
        *self.trampoline.lock() = None;
        self.counters.cache_resets.fetch_add(1, Ordering::Relaxed);
        info!("translation caches reset");
        Ok(())
    }

    /// 客户机代码 `[guest_pc, guest_pc + size)` 被改写：删除相交块的翻译缓存
    /// 条目，把描述符标记为脏并解除指向它们的链接。返回受影响的块数。
    pub fn invalidate_region(&self, guest_pc: GuestAddr, size: u64) -> usize {
        self.tcache.invalidate_region(guest_pc, size);

        let end = guest_pc.saturating_add(size);
        let mut blocks = self.blocks.write();
        let mut dead = Vec::new();
        for record in blocks.values_mut() {
            let start = record.block.guest_pc;
            if record.block.is_valid() && start < end && start.saturating_add(record.guest_len) > guest_pc {
                record.block.invalidate();
                dead.push(record.block.host_pc);
            }
        }
        for record in blocks.values_mut() {
            for &host in &dead {
                record.block.unlink_target(host);
            }
        }
        if !dead.is_empty() {
            debug!("invalidated {} blocks in {guest_pc:#x}+{size:#x}", dead.len());
        }
        dead.len()
    }

    /// 解释执行一条指令
    pub fn step(&self, ctx: &mut CpuContext) -> EngineResult<Handled> {
        let pc = ctx.pc();
        let encoding = self.memory.fetch(pc)?;
        let handled = self.dispatcher.interpret(encoding, pc, ctx, self.memory.as_ref())?;
        self.counters.interpreted_instructions.fetch_add(1, Ordering::Relaxed);
        Ok(handled)
    }

    /// 最多解释执行 `max_steps` 条指令，返回实际执行的条数
    pub fn run_interpreted(&self, ctx: &mut CpuContext, max_steps: usize) -> EngineResult<usize> {
        for executed in 0..max_steps {
            if let Err(err) = self.step(ctx) {
                debug!("interpreter stopped at {:#x} after {executed} steps: {err}", ctx.pc());
                return Err(err);
            }
        }
        Ok(max_steps)
    }

    /// 入口桩地址，必要时先写入代码缓存；调用方持有 `gate` 读锁
    #[cfg(target_arch = "x86_64")]
    fn trampoline(&self) -> EngineResult<HostAddr> {
        let mut slot = self.trampoline.lock();
        if let Some(host) = *slot {
            return Ok(host);
        }
        let mut em = Emitter::new(TRAMPOLINE_BYTES);
        emit_trampoline(&mut em)?;
        let host = self.install(em.bytes())?;
        debug!("entry trampoline at {host:#x}");
        *slot = Some(host);
        Ok(host)
    }

    /// 调用方持有 `gate` 读锁，`host` 在锁内有效
    #[cfg(target_arch = "x86_64")]
    unsafe fn call_block(&self, host: HostAddr, area: &mut SaveArea) -> EngineResult<BlockExit> {
        let entry = self.trampoline()?;
        // SAFETY: entry 指向 emit_trampoline 生成的可执行代码，遵循 SysV 调用约定，
        // 只改写调用者保存的寄存器
        let entry: EntryFn = unsafe { std::mem::transmute::<usize, EntryFn>(entry as usize) };
        unsafe { entry(area.as_mut_ptr(), host) };
        self.counters.native_blocks.fetch_add(1, Ordering::Relaxed);
        Ok(area.exit()?)
    }

    /// 在宿主上执行 `host` 处的块，返回块的退出原因
    ///
    /// 执行期间代码缓存不会被重置。块结束时保存区中的 PC 是下一条要执行的
    /// 指令；退出原因为 [`BlockExit::Interpret`] 时应先解释执行这条指令。
    ///
    /// # Safety
    ///
    /// `host` 必须是本运行时在最近一次重置之后返回的块地址。生成的访存代码把
    /// 客户机地址直接当作宿主地址使用，块内访问的地址必须在本进程中可读写。
    #[cfg(target_arch = "x86_64")]
    pub unsafe fn enter(&self, host: HostAddr, area: &mut SaveArea) -> EngineResult<BlockExit> {
        let _gate = self.gate.read();
        unsafe { self.call_block(host, area) }
    }

    /// 交替执行已翻译的块和解释器，最多 `max_blocks` 步（一个本地块或一条
    /// 解释执行的指令算一步）；PC 落在无效地址时提前返回。返回实际执行的步数。
    ///
    /// 舍入模式不是就近舍入时只用解释器。
    ///
    /// # Safety
    ///
    /// 同 [`Runtime::enter`]：块内访问的客户机地址必须是本进程中有效的宿主地址。
    #[cfg(target_arch = "x86_64")]
    pub unsafe fn run(&self, ctx: &mut CpuContext, max_blocks: usize) -> EngineResult<usize> {
        let mut area = SaveArea::new();
        for executed in 0..max_blocks {
            let pc = ctx.pc();
            if !self.memory.is_valid(pc, 4) {
                debug!("run stopped at {pc:#x} after {executed} steps");
                return Ok(executed);
            }
            if ctx.rounding_mode() != RoundingMode::Nearest {
                self.step(ctx)?;
                continue;
            }
            match self.lookup_or_translate(pc) {
                Ok(_) => {}
                Err(err) if err.is_fallback() => {
                    self.step(ctx)?;
                    continue;
                }
                Err(err) => return Err(err),
            }

            save(ctx, &mut area);
            let exit = {
                let _gate = self.gate.read();
                // 查找之后可能发生过重置，这时 pc 已不在翻译缓存中
                match self.tcache.peek(pc) {
                    // SAFETY: 地址来自读锁内的翻译缓存，访存约束由调用方保证
                    Some(entry) => match unsafe { self.call_block(entry.host, &mut area) } {
                        Ok(exit) => Some(exit),
                        Err(EngineError::CodeCache(CodeCacheError::Full { .. })) => None,
                        Err(err) => return Err(err),
                    },
                    None => None,
                }
            };
            match exit {
                Some(exit) => {
                    restore(&area, ctx)?;
                    if exit == BlockExit::Interpret {
                        self.step(ctx)?;
                    }
                }
                None => {
                    self.step(ctx)?;
                }
            }
        }
        Ok(max_blocks)
    }

    pub fn stats(&self) -> RuntimeStats {
        let c = &self.counters;
        RuntimeStats {
            translation_cache: self.tcache.stats(),
            code_cache: self.code_cache.info(),
            host_features: self.options.features,
            blocks_translated: c.blocks_translated.load(Ordering::Relaxed),
            guest_instructions: c.guest_instructions.load(Ordering::Relaxed),
            interpreted_instructions: c.interpreted_instructions.load(Ordering::Relaxed),
            fallbacks: c.fallbacks.load(Ordering::Relaxed),
            cache_resets: c.cache_resets.load(Ordering::Relaxed),
            blocks_chained: c.blocks_chained.load(Ordering::Relaxed),
            vector_alias_hits: self.options.alias_hits(),
            native_blocks: c.native_blocks.load(Ordering::Relaxed),
        }
    }
}

/// 生成入口桩：RDI = 保存区，RSI = 块地址
///
/// 先把退出原因清零，块内的侧出口会改写它。
#[cfg_attr(not(target_arch = "x86_64"), allow(dead_code))]
pub(crate) fn emit_trampoline(em: &mut Emitter) -> Result<(), EmitError> {
    em.alu_rr(Alu::Xor, Width::W32, Gpr::Rax, Gpr::Rax)?;
    em.store(Width::W32, Mem::area(offsets::EXIT as i32), Gpr::Rax)?;
    for reg in 0..HOST_VECTOR_REGS {
        em.movdqu_load(reg, Mem::area(vector_offset(reg) as i32))?;
    }
    // 入口处 rsp ≡ 8 (mod 16)，压一次栈后块看到的对齐与普通函数相同
    em.push(Gpr::Rdi)?;
    em.call(Gpr::Rsi)?;
    em.pop(Gpr::Rdi)?;
    for reg in 0..HOST_VECTOR_REGS {
        em.movdqu_store(Mem::area(vector_offset(reg) as i32), reg)?;
    }
    em.ret()
}

fn untranslatable(pc: GuestAddr, err: DispatchError) -> EngineError {
    match err {
        DispatchError::Unallocated { .. } | DispatchError::Memory(_) => EngineError::Dispatch(err),
        source => EngineError::Untranslatable { pc, source },
    }
}
