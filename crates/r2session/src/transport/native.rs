//! In-process transports calling into `libr_core`
//!
//! Both variants drive an `RCore` through the same three entry points:
//!
//! - `r_core_new() -> RCore*`
//! - `r_core_cmd_str(RCore*, const char*) -> char*` (caller frees the result)
//! - `r_core_free(RCore*)`
//!
//! [`DynamicTransport`] resolves them from a `libr_core` loaded at runtime
//! with `libloading`. `LinkedTransport` (cargo feature `r2api`) links them at
//! build time. Responses are exact return values, so no framing applies, and
//! neither variant has a side channel for event subscriptions.
//!
//! # Process-wide library
//!
//! `libr_core` is loaded at most once per process and never unloaded. The
//! first successful [`load`] stores the library and its resolved symbols;
//! later calls return immediately. A failed load stores nothing and may be
//! retried once the library is installed.

use std::ffi::{CStr, CString, OsString, c_char, c_void};
use std::io;
use std::ptr::NonNull;
use std::sync::{Arc, Mutex, OnceLock, PoisonError};

use async_trait::async_trait;
use libloading::Library;
use tracing::{debug, trace};

use crate::error::R2Error;
use crate::transport::{ShutdownMode, Transport, TransportKind};

/// Environment variable naming an explicit `libr_core` file to load
pub const R2_LIBR_CORE_ENV: &str = "R2_LIBR_CORE";

type CoreNewFn = unsafe extern "C" fn() -> *mut c_void;
type CoreFreeFn = unsafe extern "C" fn(*mut c_void);
type CoreCmdStrFn = unsafe extern "C" fn(*mut c_void, *const c_char) -> *mut c_char;

unsafe extern "C" {
    fn free(ptr: *mut c_void);
}

/// Resolved `r_core_*` entry points
#[derive(Clone, Copy)]
pub(crate) struct CoreApi {
    pub(crate) new: CoreNewFn,
    pub(crate) free: CoreFreeFn,
    pub(crate) cmd_str: CoreCmdStrFn,
}

struct NativeLibrary {
    api: CoreApi,
    name: String,
    // Keeps the resolved function pointers valid for the process lifetime
    _library: Library,
}

static LIBRARY: OnceLock<NativeLibrary> = OnceLock::new();
static LOAD_LOCK: Mutex<()> = Mutex::new(());

/// Load `libr_core` and resolve the symbols the native transports need
///
/// Idempotent: once loaded, further calls succeed without touching the
/// library. The file is `R2_LIBR_CORE` when set, otherwise the platform name
/// for `r_core` (`libr_core.so`, `libr_core.dylib`, `r_core.dll`) resolved
/// through the system loader's search path.
///
/// # Errors
///
/// - [`R2Error::Library`] if the library cannot be opened
/// - [`R2Error::MissingSymbol`] naming the first symbol that cannot be resolved
pub fn load() -> Result<(), R2Error> {
    library().map(|_| ())
}

fn library() -> Result<&'static NativeLibrary, R2Error> {
    if let Some(lib) = LIBRARY.get() {
        return Ok(lib);
    }

    let _guard = LOAD_LOCK.lock().unwrap_or_else(PoisonError::into_inner);
    if let Some(lib) = LIBRARY.get() {
        return Ok(lib);
    }

    let lib = open_library(library_path())?;
    Ok(LIBRARY.get_or_init(|| lib))
}

fn library_path() -> OsString {
    std::env::var_os(R2_LIBR_CORE_ENV)
        .filter(|path| !path.is_empty())
        .unwrap_or_else(|| libloading::library_filename("r_core"))
}

fn open_library(path: OsString) -> Result<NativeLibrary, R2Error> {
    let name = path.to_string_lossy().into_owned();
    debug!("Loading {}", name);

    // SAFETY: loading libr_core runs its initializers, which have no
    // preconditions beyond being loaded once; LOAD_LOCK serializes loads.
    let library = unsafe { Library::new(&path) }.map_err(|e| R2Error::Library {
        library: name.clone(),
        reason: e.to_string(),
    })?;

    // SAFETY: the declared signatures match the libr_core C prototypes.
    let api = unsafe {
        CoreApi {
            new: resolve::<CoreNewFn>(&library, &name, "r_core_new")?,
            free: resolve::<CoreFreeFn>(&library, &name, "r_core_free")?,
            cmd_str: resolve::<CoreCmdStrFn>(&library, &name, "r_core_cmd_str")?,
        }
    };

    debug!("Resolved r_core symbols from {}", name);
    Ok(NativeLibrary {
        api,
        name,
        _library: library,
    })
}

/// # Safety
///
/// `T` must be the function pointer type matching the symbol's C prototype.
unsafe fn resolve<T: Copy>(
    library: &Library,
    name: &str,
    symbol: &'static str,
) -> Result<T, R2Error> {
    let mut cname = Vec::with_capacity(symbol.len() + 1);
    cname.extend_from_slice(symbol.as_bytes());
    cname.push(0);

    // SAFETY: forwarded to the caller.
    unsafe { library.get::<T>(&cname) }
        .map(|sym| *sym)
        .map_err(|e| R2Error::MissingSymbol {
            symbol,
            library: name.to_string(),
            reason: e.to_string(),
        })
}

/// Owned `RCore*`
#[derive(Clone, Copy)]
struct CorePtr(NonNull<c_void>);

// SAFETY: an RCore is not thread-safe, but every use happens under the
// `NativeCore::core` mutex, so only one thread touches it at a time.
unsafe impl Send for CorePtr {}

/// State shared by both native transports
///
/// The core sits behind a blocking mutex held for the whole foreign call, so
/// a command abandoned by its caller (e.g. on timeout) still finishes before
/// the core can be freed.
struct NativeCore {
    api: CoreApi,
    core: Arc<Mutex<Option<CorePtr>>>,
    kind: TransportKind,
}

impl NativeCore {
    async fn open(api: CoreApi, kind: TransportKind, target: &str) -> Result<Self, R2Error> {
        // SAFETY: r_core_new takes no arguments and returns an owned core or NULL.
        let raw = unsafe { (api.new)() };
        let core = NonNull::new(raw)
            .map(CorePtr)
            .ok_or_else(|| R2Error::Spawn("r_core_new returned NULL".to_string()))?;

        let mut native = Self {
            api,
            core: Arc::new(Mutex::new(Some(core))),
            kind,
        };

        if !target.is_empty() {
            // radare2 reports open failures on its own output; the core stays usable
            match native.execute(&format!("o {}", target)).await {
                Ok(out) => trace!("o {} -> {:?}", target, out),
                Err(e) => debug!("Opening {} failed: {}", target, e),
            }
        }

        Ok(native)
    }

    async fn execute(&mut self, command: &str) -> Result<String, R2Error> {
        let ccmd = CString::new(command)
            .map_err(|_| R2Error::Misuse("command contains a NUL byte".to_string()))?;
        let api = self.api;
        let slot = Arc::clone(&self.core);
        let kind = self.kind;

        trace!("-> {}", command);
        let response = tokio::task::spawn_blocking(move || {
            let guard = slot.lock().unwrap_or_else(PoisonError::into_inner);
            let core = (*guard)
                .ok_or_else(|| R2Error::Misuse(format!("{} core was freed", kind.name())))?;
            // SAFETY: `core` stays live while `guard` is held; freeing it
            // requires the same lock.
            Ok::<_, R2Error>(unsafe { cmd_str(api, core, &ccmd) })
        })
        .await
        .map_err(|e| R2Error::Stream(io::Error::other(e)))??;

        trace!("<- {} bytes", response.len());
        Ok(response)
    }

    fn shutdown(&mut self) {
        let mut guard = self.core.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(core) = guard.take() {
            debug!("Freeing {} core", self.kind.name());
            // SAFETY: `core` came from r_core_new and is freed exactly once.
            unsafe { (self.api.free)(core.0.as_ptr()) };
        }
    }
}

impl Drop for NativeCore {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// # Safety
///
/// `core` must be a live core created by `api.new`.
unsafe fn cmd_str(api: CoreApi, core: CorePtr, command: &CStr) -> String {
    // SAFETY: forwarded to the caller; `command` is NUL-terminated.
    let out = unsafe { (api.cmd_str)(core.0.as_ptr(), command.as_ptr()) };
    if out.is_null() {
        return String::new();
    }

    // SAFETY: r_core_cmd_str returns a malloc'd NUL-terminated string we own.
    unsafe {
        let text = CStr::from_ptr(out).to_string_lossy().into_owned();
        free(out.cast());
        text
    }
}

/// Transport over a `libr_core` loaded at runtime
///
/// ```rust,no_run
/// use r2session::transport::{DynamicTransport, Transport};
///
/// # async fn example() -> Result<(), r2session::error::R2Error> {
/// let mut r2 = DynamicTransport::open("/bin/ls").await?;
/// println!("{}", r2.execute("i").await?);
/// # Ok(())
/// # }
/// ```
pub struct DynamicTransport {
    core: NativeCore,
}

impl DynamicTransport {
    /// Load `libr_core` if needed, create a core, and open `target` in it
    ///
    /// An empty target creates a core with nothing opened.
    pub async fn open(target: &str) -> Result<Self, R2Error> {
        let lib = library()?;
        debug!("Opening dynamic core from {}", lib.name);
        Self::with_api(lib.api, target).await
    }

    pub(crate) async fn with_api(api: CoreApi, target: &str) -> Result<Self, R2Error> {
        Ok(Self {
            core: NativeCore::open(api, TransportKind::Dynamic, target).await?,
        })
    }
}

#[async_trait]
impl Transport for DynamicTransport {
    async fn execute(&mut self, command: &str) -> Result<String, R2Error> {
        self.core.execute(command).await
    }

    async fn shutdown(&mut self, _mode: ShutdownMode) -> Result<(), R2Error> {
        self.core.shutdown();
        Ok(())
    }

    fn kind(&self) -> TransportKind {
        TransportKind::Dynamic
    }
}

#[cfg(feature = "r2api")]
mod linked {
    use super::*;

    #[link(name = "r_core")]
    unsafe extern "C" {
        fn r_core_new() -> *mut c_void;
        fn r_core_free(core: *mut c_void);
        fn r_core_cmd_str(core: *mut c_void, cmd: *const c_char) -> *mut c_char;
    }

    /// Transport over a `libr_core` linked at build time
    pub struct LinkedTransport {
        core: NativeCore,
    }

    impl LinkedTransport {
        /// Create a core and open `target` in it
        pub async fn open(target: &str) -> Result<Self, R2Error> {
            let api = CoreApi {
                new: r_core_new,
                free: r_core_free,
                cmd_str: r_core_cmd_str,
            };
            Ok(Self {
                core: NativeCore::open(api, TransportKind::Linked, target).await?,
            })
        }
    }

    #[async_trait]
    impl Transport for LinkedTransport {
        async fn execute(&mut self, command: &str) -> Result<String, R2Error> {
            self.core.execute(command).await
        }

        async fn shutdown(&mut self, _mode: ShutdownMode) -> Result<(), R2Error> {
            self.core.shutdown();
            Ok(())
        }

        fn kind(&self) -> TransportKind {
            TransportKind::Linked
        }
    }
}

#[cfg(feature = "r2api")]
pub use linked::LinkedTransport;

/// In-process stand-in for `libr_core`, used by unit tests across the crate
#[cfg(test)]
pub(crate) mod fake {
    use super::*;

    unsafe extern "C" {
        fn malloc(size: usize) -> *mut c_void;
    }

    unsafe extern "C" fn fake_new() -> *mut c_void {
        Box::into_raw(Box::new(Vec::<String>::new())).cast()
    }

    unsafe extern "C" fn fake_free(core: *mut c_void) {
        drop(unsafe { Box::from_raw(core.cast::<Vec<String>>()) });
    }

    /// Records each command; `?e <text>` echoes, `history` lists commands so
    /// far, `nil` returns NULL
    unsafe extern "C" fn fake_cmd_str(core: *mut c_void, cmd: *const c_char) -> *mut c_char {
        let history = unsafe { &mut *core.cast::<Vec<String>>() };
        let cmd = unsafe { CStr::from_ptr(cmd) }.to_string_lossy().into_owned();
        let out = if cmd == "nil" {
            None
        } else if let Some(text) = cmd.strip_prefix("?e ") {
            Some(format!("{}\n", text))
        } else if cmd == "history" {
            Some(history.join(";"))
        } else {
            Some(String::new())
        };
        history.push(cmd);

        let Some(out) = out else {
            return std::ptr::null_mut();
        };
        let bytes = out.as_bytes();
        unsafe {
            let buf = malloc(bytes.len() + 1).cast::<u8>();
            std::ptr::copy_nonoverlapping(bytes.as_ptr(), buf, bytes.len());
            *buf.add(bytes.len()) = 0;
            buf.cast()
        }
    }

    pub(crate) fn api() -> CoreApi {
        CoreApi {
            new: fake_new,
            free: fake_free,
            cmd_str: fake_cmd_str,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;

    #[tokio::test]
    async fn test_open_runs_open_command() {
        let mut r2 = DynamicTransport::with_api(fake::api(), "/bin/ls").await.unwrap();
        assert_eq!(r2.execute("history").await.unwrap(), "o /bin/ls");
    }

    #[tokio::test]
    async fn test_empty_target_opens_nothing() {
        let mut r2 = DynamicTransport::with_api(fake::api(), "").await.unwrap();
        assert_eq!(r2.execute("history").await.unwrap(), "");
    }

    #[tokio::test]
    async fn test_execute_returns_exact_value() {
        let mut r2 = DynamicTransport::with_api(fake::api(), "").await.unwrap();
        // No framing: the trailing newline from the core is preserved
        assert_eq!(r2.execute("?e hello").await.unwrap(), "hello\n");
    }

    #[tokio::test]
    async fn test_null_result_is_empty() {
        let mut r2 = DynamicTransport::with_api(fake::api(), "").await.unwrap();
        assert_eq!(r2.execute("nil").await.unwrap(), "");
    }

    #[tokio::test]
    async fn test_interior_nul_is_misuse() {
        let mut r2 = DynamicTransport::with_api(fake::api(), "").await.unwrap();
        let err = r2.execute("?e a\0b").await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Misuse);
    }

    #[tokio::test]
    async fn test_shutdown_twice_and_execute_after() {
        let mut r2 = DynamicTransport::with_api(fake::api(), "").await.unwrap();
        r2.shutdown(ShutdownMode::Graceful).await.unwrap();
        r2.shutdown(ShutdownMode::Force).await.unwrap();
        assert!(matches!(r2.execute("?e x").await, Err(R2Error::Misuse(_))));
    }

    #[tokio::test]
    async fn test_no_event_support() {
        let r2 = DynamicTransport::with_api(fake::api(), "").await.unwrap();
        assert!(!r2.supports_events());
        assert_eq!(r2.kind(), TransportKind::Dynamic);
    }

    #[test]
    fn test_library_filename_per_platform() {
        let name = libloading::library_filename("r_core");
        let name = name.to_string_lossy();
        assert!(name.contains("r_core"));
        if cfg!(target_os = "linux") {
            assert_eq!(name, "libr_core.so");
        }
    }

    #[test]
    fn test_load_is_idempotent() {
        // Whether or not libr_core is installed, repeated loads agree
        let first = load();
        let second = load();
        assert_eq!(first.is_ok(), second.is_ok());
        if let Err(e) = first {
            assert_eq!(e.kind(), ErrorKind::Construction);
        }
    }

    #[test]
    fn test_missing_library_is_construction_error() {
        let result = open_library(OsString::from("/nonexistent/libr_core.so"));
        match result {
            Err(R2Error::Library { library, .. }) => {
                assert_eq!(library, "/nonexistent/libr_core.so")
            }
            Err(other) => panic!("unexpected error: {}", other),
            Ok(_) => panic!("loading a nonexistent library succeeded"),
        }
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn test_library_without_core_symbols_names_the_symbol() {
        let err = match open_library(OsString::from("libc.so.6")) {
            Err(e) => e,
            Ok(_) => panic!("libc resolved r_core_new"),
        };
        assert_eq!(err.kind(), ErrorKind::Construction);
        match err {
            R2Error::MissingSymbol {
                symbol, library, ..
            } => {
                assert_eq!(symbol, "r_core_new");
                assert_eq!(library, "libc.so.6");
            }
            other => panic!("unexpected error: {}", other),
        }
    }
}
