//! Hosting analyzer modules in wasmtime.
//!
//! A module either exports `query(ptr, len) -> (ptr, len)` together with
//! `malloc`/`free` and keeps its database in memory between calls, or is a
//! plain WASI command that reads one request on stdin and answers on stdout.
//! Commands are re-run with the full migration list for every request.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use wasmtime::{Config, Engine, Instance, Linker, Memory, Module, Store, TypedFunc};
use wasmtime_wasi::pipe::{MemoryInputPipe, MemoryOutputPipe};
use wasmtime_wasi::preview1::{self, WasiP1Ctx};
use wasmtime_wasi::{I32Exit, WasiCtxBuilder};

use super::protocol::{Request, Response};
use crate::error::{Error, Result};

const PROGRAM: &str = "analyzer.wasm";
const OUTPUT_CAPACITY: usize = 16 << 20;
const QUERY_EXPORT: &str = "query";

fn trap(context: &str, err: wasmtime::Error) -> Error {
    Error::Sandbox(format!("{context}: {err:#}"))
}

/// Set once the caller of a request has stopped waiting for it.
#[derive(Debug, Clone, Default)]
pub struct Cancelled(Arc<AtomicBool>);

impl Cancelled {
    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    fn check(&self) -> Result<()> {
        if self.0.load(Ordering::SeqCst) {
            return Err(Error::Aborted("sandbox request".into()));
        }
        Ok(())
    }
}

/// Arms the epoch deadline for the next call into `store`. The flag is read
/// after arming: an interrupt that landed before the deadline existed would
/// otherwise be lost.
fn arm<T>(store: &mut Store<T>, cancelled: &Cancelled) -> Result<()> {
    store.set_epoch_deadline(1);
    cancelled.check()
}

/// A compiled module and the engine that runs it. Each runtime owns its
/// engine so that interrupting one analyzer leaves the others alone.
pub struct Runtime {
    engine: Engine,
    module: Module,
    linker: Linker<WasiP1Ctx>,
    instantiations: AtomicUsize,
}

impl Runtime {
    pub fn new(bytes: &[u8]) -> Result<Self> {
        let mut config = Config::new();
        config.epoch_interruption(true);
        let engine = Engine::new(&config).map_err(|e| trap("create engine", e))?;
        let module = Module::new(&engine, bytes).map_err(|e| trap("compile module", e))?;
        let mut linker = Linker::new(&engine);
        preview1::add_to_linker_sync(&mut linker, |cx| cx).map_err(|e| trap("link wasi", e))?;
        Ok(Self {
            engine,
            module,
            linker,
            instantiations: AtomicUsize::new(0),
        })
    }

    /// Traps whatever the module is currently executing. Pair with
    /// [`Cancelled::cancel`] so calls that have not started yet stop too.
    pub fn interrupt(&self) {
        self.engine.increment_epoch();
    }

    #[cfg(test)]
    pub fn instantiations(&self) -> usize {
        self.instantiations.load(Ordering::SeqCst)
    }

    fn instantiate(&self, args: &[&str], stdin: Vec<u8>, cancelled: &Cancelled) -> Result<Running> {
        let stdout = MemoryOutputPipe::new(OUTPUT_CAPACITY);
        let stderr = MemoryOutputPipe::new(OUTPUT_CAPACITY);
        let wasi = WasiCtxBuilder::new()
            .args(args)
            .env("DBPROBE_VERSION", env!("CARGO_PKG_VERSION"))
            .stdin(MemoryInputPipe::new(stdin))
            .stdout(stdout.clone())
            .stderr(stderr.clone())
            .build_p1();

        let mut store = Store::new(&self.engine, wasi);
        arm(&mut store, cancelled)?;
        let instance = self
            .linker
            .instantiate(&mut store, &self.module)
            .map_err(|e| trap("instantiate module", e))?;
        let n = self.instantiations.fetch_add(1, Ordering::SeqCst) + 1;
        tracing::debug!(instantiations = n, "sandbox module instantiated");

        Ok(Running {
            store,
            instance,
            stdout,
            stderr,
        })
    }
}

struct Running {
    store: Store<WasiP1Ctx>,
    instance: Instance,
    stdout: MemoryOutputPipe,
    stderr: MemoryOutputPipe,
}

impl Running {
    /// Runs the reactor initializer and command entry point, whichever exist.
    fn run_entry_points(&mut self) -> Result<()> {
        for name in ["_initialize", "_start"] {
            let Ok(entry) = self.instance.get_typed_func::<(), ()>(&mut self.store, name) else {
                continue;
            };
            if let Err(e) = entry.call(&mut self.store, ()) {
                match e.downcast_ref::<I32Exit>() {
                    Some(I32Exit(0)) => {}
                    Some(I32Exit(code)) => {
                        return Err(Error::Sandbox(format!(
                            "module exited with status {code}: {}",
                            self.stderr_text()
                        )))
                    }
                    None => return Err(trap(&format!("{name} ({})", self.stderr_text()), e)),
                }
            }
        }
        Ok(())
    }

    fn stdout(&self) -> Vec<u8> {
        self.stdout.contents().to_vec()
    }

    fn stderr_text(&self) -> String {
        String::from_utf8_lossy(&self.stderr.contents()).trim().to_string()
    }

    fn response(&self) -> Result<Response> {
        Response::parse(&self.stdout(), &self.stderr.contents())
    }
}

/// How requests reach a running module.
pub trait Channel: Send {
    fn call(&mut self, req: &Request, cancelled: &Cancelled) -> Result<Response>;
}

/// Requests are written into the module's memory and passed to its `query`
/// export.
struct Exported {
    running: Running,
    memory: Memory,
    query: TypedFunc<(i32, i32), (i32, i32)>,
    malloc: TypedFunc<i32, i32>,
    free: TypedFunc<i32, ()>,
}

impl Exported {
    fn from_running(mut running: Running) -> Option<Result<Self>> {
        let query = running
            .instance
            .get_typed_func::<(i32, i32), (i32, i32)>(&mut running.store, QUERY_EXPORT)
            .ok()?;
        Some(Self::bind(running, query))
    }

    fn bind(mut running: Running, query: TypedFunc<(i32, i32), (i32, i32)>) -> Result<Self> {
        let store = &mut running.store;
        let memory = running
            .instance
            .get_memory(&mut *store, "memory")
            .ok_or_else(|| Error::Sandbox("module does not export memory".into()))?;
        let malloc = running
            .instance
            .get_typed_func::<i32, i32>(&mut *store, "malloc")
            .map_err(|_| Error::Sandbox("module does not export malloc/free".into()))?;
        let free = running
            .instance
            .get_typed_func::<i32, ()>(&mut *store, "free")
            .map_err(|_| Error::Sandbox("module does not export malloc/free".into()))?;
        Ok(Self {
            running,
            memory,
            query,
            malloc,
            free,
        })
    }

    fn invoke(&mut self, ptr: i32, input: &[u8]) -> Result<Vec<u8>> {
        let store = &mut self.running.store;
        self.memory
            .write(&mut *store, ptr as u32 as usize, input)
            .map_err(|e| Error::Sandbox(format!("write request: {e}")))?;
        let (out_ptr, out_len) = self
            .query
            .call(&mut *store, (ptr, input.len() as i32))
            .map_err(|e| trap("query", e))?;
        let (out_ptr, out_len) = (out_ptr as u32 as usize, out_len as u32 as usize);
        let in_bounds = out_ptr
            .checked_add(out_len)
            .is_some_and(|end| end <= self.memory.data_size(&*store));
        if !in_bounds {
            return Err(Error::Sandbox(format!(
                "response of {out_len} bytes at {out_ptr} is out of bounds"
            )));
        }
        let mut output = vec![0u8; out_len];
        self.memory
            .read(&*store, out_ptr, &mut output)
            .map_err(|e| Error::Sandbox(format!("read response: {e}")))?;
        Ok(output)
    }
}

impl Channel for Exported {
    fn call(&mut self, req: &Request, cancelled: &Cancelled) -> Result<Response> {
        let input = serde_json::to_vec(req)?;
        arm(&mut self.running.store, cancelled)?;
        let ptr = self
            .malloc
            .call(&mut self.running.store, input.len() as i32)
            .map_err(|e| trap("malloc", e))?;
        let output = self.invoke(ptr, &input);
        if let Err(e) = self.free.call(&mut self.running.store, ptr) {
            tracing::debug!(error = %e, "sandbox free failed");
        }
        Response::parse(&output?, b"")
    }
}

/// Every request runs a fresh instance that replays the migrations.
struct Reinstantiate {
    runtime: Arc<Runtime>,
    migrations: Vec<String>,
}

impl Channel for Reinstantiate {
    fn call(&mut self, req: &Request, cancelled: &Cancelled) -> Result<Response> {
        let full = Request {
            migrations: self.migrations.clone(),
            ..req.clone()
        };
        let mut running = self
            .runtime
            .instantiate(&[PROGRAM, req.kind.as_str()], serde_json::to_vec(&full)?, cancelled)?;
        running.run_entry_points()?;
        running.response()
    }
}

/// An initialized module, bound to one migration set.
pub struct Session {
    pub migrations: Vec<String>,
    channel: Box<dyn Channel>,
}

impl Session {
    /// Instantiates the module and applies `migrations` through an `init`
    /// request.
    pub fn start(runtime: &Arc<Runtime>, migrations: Vec<String>, cancelled: &Cancelled) -> Result<Self> {
        let init = Request::init(migrations.clone());
        let mut running = runtime.instantiate(&[PROGRAM], serde_json::to_vec(&init)?, cancelled)?;
        running.run_entry_points()?;
        let stdout = running.stdout();

        let channel: Box<dyn Channel> = match Exported::from_running(running) {
            Some(exported) => {
                let mut exported = exported?;
                // Reactors may answer init on stdout or only through `query`.
                let response = if stdout.iter().all(u8::is_ascii_whitespace) {
                    exported.call(&init, cancelled)?
                } else {
                    Response::parse(&stdout, b"")?
                };
                response.into_init()?;
                tracing::debug!("sandbox module exports query; calling it directly");
                Box::new(exported)
            }
            None => {
                Response::parse(&stdout, b"")?.into_init()?;
                tracing::debug!("sandbox module is a command; re-instantiating per request");
                Box::new(Reinstantiate {
                    runtime: runtime.clone(),
                    migrations: migrations.clone(),
                })
            }
        };

        Ok(Self {
            migrations,
            channel,
        })
    }

    pub fn call(&mut self, req: &Request, cancelled: &Cancelled) -> Result<Response> {
        self.channel.call(req, cancelled)
    }
}
