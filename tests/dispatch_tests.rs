use std::fs;
use std::path::Path;
use std::sync::Arc;
use std::thread;

use anyhow::Result;
use transcache::abi::{CodePtr, ExecutionState};
use transcache::cache::{CacheController, ProcessIdentity};
use transcache::codegen::{Arch, CallConv, TranslatedFunction, change_call_conv};
use transcache::config::{CacheConfig, TranslatorConfig};
use transcache::runtime::{
    Backend, BackendError, CodeLoader, CodeRange, DispatchStats, ExecutionContext, LoadError,
    LocalTranslator, ProcessContext, TranslationServer,
};

const MAGIC: &[u8] = b"OBJ\0";
const USER: ProcessIdentity = ProcessIdentity {
    real_uid: 1000,
    effective_uid: 1000,
};

/// Every guest address holds four bytes derived from the address itself.
#[derive(Default)]
struct SyntheticBackend {
    lifted: usize,
}

impl Backend for SyntheticBackend {
    type Function = TranslatedFunction;

    fn decode(&mut self, addr: u64) -> Result<Vec<CodeRange>, BackendError> {
        if addr == 0 {
            return Err(BackendError::Decode {
                addr,
                reason: "null page".into(),
            });
        }
        Ok(vec![CodeRange::new(addr, addr + 4)])
    }

    fn read_code(&mut self, range: CodeRange, buf: &mut [u8]) -> Result<(), BackendError> {
        buf.copy_from_slice(&(range.start as u32).to_le_bytes());
        Ok(())
    }

    fn lift(&mut self, addr: u64, _ranges: &[CodeRange]) -> Result<Self::Function, BackendError> {
        self.lifted += 1;
        Ok(TranslatedFunction::lifted(
            format!("S0_{addr:x}"),
            addr,
            Arc::new(|_: &mut [u8]| {}),
        ))
    }

    fn codegen(&mut self, function: Self::Function) -> Result<Vec<u8>, BackendError> {
        let mut object = MAGIC.to_vec();
        object.extend_from_slice(function.name().as_bytes());
        object.extend_from_slice(format!(":{}", function.param_count()).as_bytes());
        Ok(object)
    }
}

#[derive(Default)]
struct RecordingLoader {
    loaded: Vec<Vec<u8>>,
}

impl CodeLoader for RecordingLoader {
    fn load(&mut self, addr: u64, object: &[u8]) -> Result<CodePtr, LoadError> {
        if !object.starts_with(MAGIC) {
            return Err(LoadError::Malformed {
                addr,
                reason: "bad magic".into(),
            });
        }
        self.loaded.push(object.to_vec());
        CodePtr::new(0x7000_0000 + self.loaded.len() * 0x1000)
            .ok_or(LoadError::MissingEntry { addr })
    }
}

type Process = ProcessContext<LocalTranslator<SyntheticBackend, RecordingLoader>>;

fn process(cache_root: Option<&Path>) -> Process {
    let cache = cache_root.map(CacheConfig::at).unwrap_or_default();
    let config = TranslatorConfig {
        guest_arch: Arch::X86_64,
        host_arch: Arch::X86_64,
        cache,
        ..TranslatorConfig::default()
    };
    let controller = CacheController::with_identity(&config.cache, USER);
    let server = TranslationServer::with_cache(SyntheticBackend::default(), config, controller);
    ProcessContext::new(LocalTranslator::new(server, RecordingLoader::default()))
}

fn lifted(process: &Process) -> usize {
    process.translator().server().backend().lifted
}

#[test]
fn repeated_dispatch_uses_the_quick_table() -> Result<()> {
    let process = process(None);
    let mut cpu = ExecutionContext::new(&process);

    let first = cpu.lookup(0x40_1000)?;
    for _ in 0..10 {
        assert_eq!(cpu.lookup(0x40_1000)?, first);
    }

    assert_eq!(
        cpu.stats(),
        DispatchStats {
            fast: 10,
            slow: 1,
            translated: 1
        }
    );
    assert_eq!(lifted(&process), 1);
    assert!(process.translation_time() > std::time::Duration::ZERO);
    Ok(())
}

#[test]
fn colliding_addresses_fall_back_to_the_process_context() -> Result<()> {
    let process = process(None);
    let mut cpu = ExecutionContext::new(&process);

    // Same dispatch table index, different keys.
    let a = cpu.lookup(0x1000)?;
    let b = cpu.lookup(0x1000 + (1 << 10))?;
    assert_ne!(a, b);
    assert_eq!(cpu.lookup(0x1000)?, a);

    let stats = cpu.stats();
    assert_eq!(stats.slow, 3);
    assert_eq!(stats.translated, 2);
    assert_eq!(lifted(&process), 2);
    Ok(())
}

#[test]
fn translated_code_is_shared_between_execution_contexts() -> Result<()> {
    let process = process(None);

    thread::scope(|scope| {
        for _ in 0..4 {
            scope.spawn(|| {
                let mut cpu = ExecutionContext::new(&process);
                for addr in (0x1000..0x1100).step_by(4) {
                    cpu.lookup(addr).expect("lookup");
                }
            });
        }
    });

    assert_eq!(lifted(&process), 64);
    assert_eq!(process.translated_count(), 64);
    Ok(())
}

#[test]
fn invalidation_flushes_dispatch_tables() -> Result<()> {
    let process = process(None);
    let mut cpu = ExecutionContext::new(&process);
    cpu.lookup(0x2000)?;
    cpu.lookup(0x2000)?;

    process.invalidate_translations();
    cpu.lookup(0x2000)?;

    let stats = cpu.stats();
    assert_eq!(stats.fast, 1);
    assert_eq!(stats.slow, 2);
    assert_eq!(stats.translated, 2);
    assert_eq!(cpu.state().tlb_generation(), process.generation());
    Ok(())
}

#[test]
fn cache_survives_process_restart() -> Result<()> {
    let dir = tempfile::tempdir()?;

    let first = process(Some(dir.path()));
    let code = ExecutionContext::new(&first).lookup(0x40_1000)?;
    assert_eq!(code.addr(), 0x7000_1000);
    assert_eq!(lifted(&first), 1);
    let compiled = first.translator().loader().loaded[0].clone();
    assert!(compiled.ends_with(b"S0_401000:15"));

    let second = process(Some(dir.path()));
    ExecutionContext::new(&second).lookup(0x40_1000)?;
    assert_eq!(lifted(&second), 0);
    assert_eq!(second.translator().server().stats().cache_hits, 1);
    assert_eq!(second.translator().loader().loaded, [compiled]);
    Ok(())
}

#[test]
fn unloadable_cache_entry_is_retranslated() -> Result<()> {
    let dir = tempfile::tempdir()?;

    let first = process(Some(dir.path()));
    ExecutionContext::new(&first).lookup(0x3000)?;
    let entries: Vec<_> = fs::read_dir(dir.path())?.collect::<Result<_, _>>()?;
    assert_eq!(entries.len(), 1);
    fs::write(entries[0].path(), b"garbage")?;

    let second = process(Some(dir.path()));
    ExecutionContext::new(&second).lookup(0x3000)?;
    assert_eq!(lifted(&second), 1);
    assert_eq!(second.translator().loader().loaded.len(), 1);
    // The damaged entry is never replaced.
    assert_eq!(fs::read(entries[0].path())?, b"garbage");
    Ok(())
}

#[test]
fn failed_translation_is_not_installed() {
    let process = process(None);
    let mut cpu = ExecutionContext::new(&process);
    assert!(cpu.lookup(0).is_err());
    assert_eq!(cpu.state().quick_tlb().occupied(), 0);
    assert_eq!(process.translated_count(), 0);
}

#[test]
fn fast_wrapper_works_on_execution_state_registers() {
    // rax = rax * 2 + rcx
    let function = TranslatedFunction::lifted(
        "S0_1000",
        0x1000,
        Arc::new(|regs: &mut [u8]| {
            let read = |regs: &[u8], offset: usize| {
                u64::from_ne_bytes(regs[offset..offset + 8].try_into().expect("8 bytes"))
            };
            let value = read(regs, 0x08) * 2 + read(regs, 0x10);
            regs[0x08..0x10].copy_from_slice(&value.to_ne_bytes());
        }),
    );
    let wrapper = change_call_conv(function, CallConv::Hhvm, Arch::X86_64).expect("infallible");

    let mut state = ExecutionState::new_boxed(std::ptr::null::<()>());
    let mut args = vec![0u64; wrapper.param_count()];
    args[0] = state.as_ptr() as u64;
    args[1] = 0x1000;
    args[2] = 20;
    args[3] = 2;
    let results = wrapper.invoke(state.regs_mut(), &args);

    assert_eq!(results[1], 42);
    assert_eq!(state.read_reg(0x08), 42);
    assert_eq!(state.read_reg(0x10), 2);
}
