//! JNI bridge for the Android VpnService.
//!
//! Every running engine lives behind a `jlong` handle returned by
//! `nativeStart`; nothing is kept in process-wide statics.

use std::os::fd::{AsRawFd, BorrowedFd, FromRawFd, OwnedFd};
use std::sync::Arc;

use jni::objects::{GlobalRef, JClass, JIntArray, JObject, JString, JValue};
use jni::sys::{jboolean, jint, jlong, jstring, JNI_TRUE};
use jni::{JNIEnv, JavaVM};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc::UnboundedReceiver;

use tunsnare::capture::CaptureMode;
use tunsnare::discovery::{self, DiscoveryError, ProxyCertificate, StoredProxy, ValidatedProxy};
use tunsnare::engine::{
    CertificateTrust, ChannelObserver, Engine, EngineConfig, StatusEvent, TrustStatus,
};
use tunsnare::mux::SocketProtector;

/// What `nativeDiscover` hands back and `nativeStart` accepts. The
/// fingerprint is informational; `nativeStart` pins against the setup link.
#[derive(Debug, Serialize, Deserialize)]
struct DiscoveredProxy {
    proxy: StoredProxy,
    fingerprint: String,
}

#[derive(Debug, Serialize)]
struct DiscoveryFailure {
    error: &'static str,
    message: String,
}

fn failure_kind(err: &DiscoveryError) -> &'static str {
    match err {
        DiscoveryError::InvalidSetupUri(_) => "invalid_uri",
        DiscoveryError::CertificateMismatch { .. } => "certificate_mismatch",
        DiscoveryError::InvalidCertificate(_) => "invalid_certificate",
        DiscoveryError::Timeout => "timeout",
        DiscoveryError::ConnectionRefused => "connection_refused",
        DiscoveryError::BadResponse { .. } => "bad_response",
        DiscoveryError::Unreachable(_) | DiscoveryError::NoCandidates => "unreachable",
    }
}

// ── Host callbacks ───────────────────────────────────────────────────────────

/// Calls back into the VpnService that owns the tunnel.
struct VpnServiceHost {
    jvm: JavaVM,
    service: GlobalRef,
}

impl SocketProtector for VpnServiceHost {
    fn protect(&self, fd: BorrowedFd<'_>) -> bool {
        let mut env = match self.jvm.attach_current_thread_as_daemon() {
            Ok(env) => env,
            Err(e) => {
                log::warn!("protect: cannot attach thread: {e}");
                return false;
            }
        };
        let protected = env
            .call_method(
                self.service.as_obj(),
                "protect",
                "(I)Z",
                &[JValue::Int(fd.as_raw_fd())],
            )
            .and_then(|value| value.z());
        match protected {
            Ok(ok) => ok,
            Err(e) => {
                log::warn!("protect: VpnService.protect failed: {e}");
                false
            }
        }
    }
}

impl CertificateTrust for VpnServiceHost {
    /// `whereIsCertTrusted(String pem)` answers "system", "user" or null.
    fn trust_status(&self, certificate: &ProxyCertificate) -> TrustStatus {
        let lookup = || -> jni::errors::Result<TrustStatus> {
            let mut env = self.jvm.attach_current_thread_as_daemon()?;
            let pem = env.new_string(certificate.pem())?;
            let answer = env
                .call_method(
                    self.service.as_obj(),
                    "whereIsCertTrusted",
                    "(Ljava/lang/String;)Ljava/lang/String;",
                    &[JValue::Object(&pem)],
                )?
                .l()?;
            if answer.is_null() {
                return Ok(TrustStatus::Untrusted);
            }
            let answer: String = env.get_string(&JString::from(answer))?.into();
            Ok(match answer.as_str() {
                "system" => TrustStatus::System,
                "user" => TrustStatus::User,
                _ => TrustStatus::Unknown,
            })
        };
        lookup().unwrap_or_else(|e| {
            log::warn!("trust lookup failed: {e}");
            TrustStatus::Unknown
        })
    }
}

// ── Handles ──────────────────────────────────────────────────────────────────

struct Bridge {
    engine: Engine,
    events: Mutex<UnboundedReceiver<StatusEvent>>,
}

/// # Safety
/// `handle` must come from `nativeStart` and not have been released.
unsafe fn bridge<'a>(handle: jlong) -> Option<&'a Bridge> {
    (handle as *const Bridge).as_ref()
}

fn to_jstring(env: &mut JNIEnv, value: &str) -> jstring {
    match env.new_string(value) {
        Ok(s) => s.into_raw(),
        Err(e) => {
            log::error!("cannot create Java string: {e}");
            std::ptr::null_mut()
        }
    }
}

// ── Entry points ─────────────────────────────────────────────────────────────

#[no_mangle]
pub extern "system" fn Java_net_tunsnare_TunsnareBridge_nativeInit(_env: JNIEnv, _class: JClass) {
    #[cfg(target_os = "android")]
    android_logger::init_once(
        android_logger::Config::default()
            .with_max_level(log::LevelFilter::Debug)
            .with_tag("tunsnare"),
    );
    log::info!("tunsnare native initialized");
}

/// Validate the proxy behind a setup link. Returns `DiscoveredProxy` JSON on
/// success, `{"error", "message"}` JSON on failure.
#[no_mangle]
pub extern "system" fn Java_net_tunsnare_TunsnareBridge_nativeDiscover(
    mut env: JNIEnv,
    _class: JClass,
    uri: JString,
) -> jstring {
    let uri: String = match env.get_string(&uri) {
        Ok(s) => s.into(),
        Err(e) => {
            log::error!("nativeDiscover: bad uri argument: {e}");
            return std::ptr::null_mut();
        }
    };

    let runtime = match tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
    {
        Ok(rt) => rt,
        Err(e) => {
            log::error!("nativeDiscover: runtime: {e}");
            return std::ptr::null_mut();
        }
    };
    let result = runtime.block_on(async {
        let info = discovery::parse_setup_uri(&uri)?;
        discovery::discover(&info).await
    });

    let json = match result {
        Ok(proxy) => serde_json::to_string(&DiscoveredProxy {
            proxy: proxy.to_stored(),
            fingerprint: proxy.certificate().fingerprint().to_string(),
        }),
        Err(e) => serde_json::to_string(&DiscoveryFailure {
            error: failure_kind(&e),
            message: e.to_string(),
        }),
    };
    match json {
        Ok(json) => to_jstring(&mut env, &json),
        Err(e) => {
            log::error!("nativeDiscover: encode: {e}");
            std::ptr::null_mut()
        }
    }
}

/// Start intercepting on `tun_fd`, which must already be detached from its
/// ParcelFileDescriptor. `setup_uri` is the link the proxy was discovered
/// from; its fingerprint pins the certificate in `proxy_json`. Returns 0 on
/// failure, after closing `tun_fd`.
#[no_mangle]
pub extern "system" fn Java_net_tunsnare_TunsnareBridge_nativeStart(
    mut env: JNIEnv,
    _class: JClass,
    service: JObject,
    tun_fd: jint,
    setup_uri: JString,
    proxy_json: JString,
    ports: JIntArray,
    socks: jboolean,
) -> jlong {
    if tun_fd < 0 {
        log::error!("nativeStart: invalid tun fd {tun_fd}");
        return 0;
    }
    // SAFETY: the caller detached this descriptor and hands us ownership.
    // From here on every return path either moves or drops it.
    let tunnel = unsafe { OwnedFd::from_raw_fd(tun_fd) };
    let args = StartArgs {
        setup_uri: &setup_uri,
        proxy_json: &proxy_json,
        ports: &ports,
        socks: socks == JNI_TRUE,
    };
    match start(&mut env, &service, tunnel, args) {
        Ok(bridge) => Box::into_raw(bridge) as jlong,
        Err(e) => {
            log::error!("nativeStart: {e}");
            0
        }
    }
}

struct StartArgs<'a, 'local> {
    setup_uri: &'a JString<'local>,
    proxy_json: &'a JString<'local>,
    ports: &'a JIntArray<'local>,
    socks: bool,
}

fn start(
    env: &mut JNIEnv,
    service: &JObject,
    tunnel: OwnedFd,
    args: StartArgs<'_, '_>,
) -> Result<Box<Bridge>, String> {
    let uri: String = env
        .get_string(args.setup_uri)
        .map_err(|e| format!("setup uri argument: {e}"))?
        .into();
    let link = discovery::parse_setup_uri(&uri).map_err(|e| e.to_string())?;
    let json: String = env
        .get_string(args.proxy_json)
        .map_err(|e| format!("proxy argument: {e}"))?
        .into();
    let discovered: DiscoveredProxy =
        serde_json::from_str(&json).map_err(|e| format!("proxy json: {e}"))?;
    let proxy = ValidatedProxy::restore(&discovered.proxy, &link).map_err(|e| e.to_string())?;
    let ports = read_ports(env, args.ports)?;

    let host = Arc::new(VpnServiceHost {
        jvm: env.get_java_vm().map_err(|e| format!("java vm: {e}"))?,
        service: env
            .new_global_ref(service)
            .map_err(|e| format!("service ref: {e}"))?,
    });

    let mut config = EngineConfig::new(proxy);
    if !ports.is_empty() {
        config.redirect_ports = ports;
    }
    if args.socks {
        config.capture_mode = CaptureMode::Socks5;
    }
    config.protector = host.clone();
    config.trust = host;

    let (observer, events) = ChannelObserver::new();
    let engine = Engine::new(config, Arc::new(observer));
    engine.start(tunnel).map_err(|e| e.to_string())?;

    Ok(Box::new(Bridge {
        engine,
        events: Mutex::new(events),
    }))
}

fn read_ports(env: &mut JNIEnv, ports: &JIntArray) -> Result<Vec<u16>, String> {
    if ports.is_null() {
        return Ok(Vec::new());
    }
    let len = env
        .get_array_length(ports)
        .map_err(|e| format!("ports length: {e}"))?;
    let mut raw = vec![0 as jint; usize::try_from(len).unwrap_or(0)];
    env.get_int_array_region(ports, 0, &mut raw)
        .map_err(|e| format!("ports: {e}"))?;
    raw.into_iter()
        .map(|p| {
            u16::try_from(p)
                .ok()
                .filter(|p| *p != 0)
                .ok_or_else(|| format!("invalid port {p}"))
        })
        .collect()
}

/// Next status event as JSON, or null when none is pending.
#[no_mangle]
pub extern "system" fn Java_net_tunsnare_TunsnareBridge_nativePollEvent(
    mut env: JNIEnv,
    _class: JClass,
    handle: jlong,
) -> jstring {
    // SAFETY: the Java side only passes handles from nativeStart.
    let Some(bridge) = (unsafe { bridge(handle) }) else {
        return std::ptr::null_mut();
    };
    let Ok(event) = bridge.events.lock().try_recv() else {
        return std::ptr::null_mut();
    };
    match serde_json::to_string(&event) {
        Ok(json) => to_jstring(&mut env, &json),
        Err(e) => {
            log::error!("nativePollEvent: encode: {e}");
            std::ptr::null_mut()
        }
    }
}

#[no_mangle]
pub extern "system" fn Java_net_tunsnare_TunsnareBridge_nativeIsRunning(
    _env: JNIEnv,
    _class: JClass,
    handle: jlong,
) -> jboolean {
    // SAFETY: see nativePollEvent.
    let running = unsafe { bridge(handle) }.is_some_and(|b| b.engine.is_running());
    jboolean::from(running)
}

#[no_mangle]
pub extern "system" fn Java_net_tunsnare_TunsnareBridge_nativeStop(
    _env: JNIEnv,
    _class: JClass,
    handle: jlong,
) {
    // SAFETY: see nativePollEvent.
    if let Some(bridge) = unsafe { bridge(handle) } {
        bridge.engine.stop();
    }
}

/// Stop and free the engine. The handle is invalid afterwards.
#[no_mangle]
pub extern "system" fn Java_net_tunsnare_TunsnareBridge_nativeRelease(
    _env: JNIEnv,
    _class: JClass,
    handle: jlong,
) {
    if handle == 0 {
        return;
    }
    // SAFETY: the handle came from Box::into_raw in nativeStart and the Java
    // side releases it exactly once.
    let bridge = unsafe { Box::from_raw(handle as *mut Bridge) };
    bridge.engine.stop();
    log::info!("tunsnare engine released");
}
