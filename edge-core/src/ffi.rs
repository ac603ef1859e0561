//! C ABI for linking edge-core as a static library from C/C++ hosts.
//!
//! Handles and data objects cross the boundary as opaque 64-bit tokens.
//! Tokens are never reused, so a released or foreign token fails with
//! `ERROR_INVALID_PARAMETER` instead of touching freed memory.

use std::ffi::{c_char, c_void, CStr};
use std::os::raw::c_int;
use std::slice;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};

use dashmap::DashMap;

use crate::data::EdgeData;
use crate::error::{EdgeError, Result, ERROR_INVALID_PARAMETER, ERROR_NONE};
use crate::event::{EdgeEvent, EventCallback, EventKind};
use crate::handle::EdgeHandle;
use crate::protocol::{ConnectType, Roles};

pub type EdgeToken = u64;

/// Event callback: `kind` as in `event_code`, payload bytes valid only for the call.
/// For NEW_DATA_RECEIVED the payload is the full-data serialization
/// (see `edge_data_deserialize`). A non-zero return rejects a capability.
pub type EdgeEventFn =
    extern "C" fn(kind: c_int, payload: *const u8, len: usize, user: *mut c_void) -> c_int;

static NEXT_TOKEN: AtomicU64 = AtomicU64::new(1);

fn handles() -> &'static DashMap<EdgeToken, Arc<EdgeHandle>> {
    static HANDLES: OnceLock<DashMap<EdgeToken, Arc<EdgeHandle>>> = OnceLock::new();
    HANDLES.get_or_init(DashMap::new)
}

fn datas() -> &'static DashMap<EdgeToken, Arc<EdgeData>> {
    static DATAS: OnceLock<DashMap<EdgeToken, Arc<EdgeData>>> = OnceLock::new();
    DATAS.get_or_init(DashMap::new)
}

fn next_token() -> EdgeToken {
    NEXT_TOKEN.fetch_add(1, Ordering::Relaxed)
}

fn handle(token: EdgeToken) -> Result<Arc<EdgeHandle>> {
    handles()
        .get(&token)
        .map(|h| h.clone())
        .ok_or_else(|| EdgeError::invalid("unknown handle"))
}

fn data(token: EdgeToken) -> Result<Arc<EdgeData>> {
    datas()
        .get(&token)
        .map(|d| d.clone())
        .ok_or_else(|| EdgeError::invalid("unknown data object"))
}

fn code(result: Result<()>) -> c_int {
    match result {
        Ok(()) => ERROR_NONE,
        Err(e) => e.code(),
    }
}

/// Borrow a NUL-terminated UTF-8 string.
unsafe fn text<'a>(ptr: *const c_char) -> Result<&'a str> {
    if ptr.is_null() {
        return Err(EdgeError::invalid("null string"));
    }
    CStr::from_ptr(ptr)
        .to_str()
        .map_err(|_| EdgeError::invalid("string is not UTF-8"))
}

/// Copy `value` plus a NUL into `out`. Returns the length without the NUL.
unsafe fn write_text(value: &str, out: *mut c_char, out_len: usize) -> c_int {
    if out.is_null() || value.len() + 1 > out_len {
        return ERROR_INVALID_PARAMETER;
    }
    out.copy_from_nonoverlapping(value.as_ptr() as *const c_char, value.len());
    *out.add(value.len()) = 0;
    value.len() as c_int
}

unsafe fn write_bytes(value: &[u8], out: *mut u8, out_len: usize) -> c_int {
    if out.is_null() || value.len() > out_len || value.len() > c_int::MAX as usize {
        return ERROR_INVALID_PARAMETER;
    }
    out.copy_from_nonoverlapping(value.as_ptr(), value.len());
    value.len() as c_int
}

fn connect_type(code: c_int) -> Option<ConnectType> {
    match code {
        0 => Some(ConnectType::Tcp),
        1 => Some(ConnectType::BrokerPubsub),
        2 => Some(ConnectType::Hybrid),
        3 => Some(ConnectType::Custom),
        _ => None,
    }
}

/// Numeric event kind passed to `EdgeEventFn`.
pub fn event_code(kind: EventKind) -> c_int {
    match kind {
        EventKind::Unknown => -1,
        EventKind::CallbackReleased => 0,
        EventKind::Capability => 1,
        EventKind::NewDataReceived => 2,
        EventKind::ConnectionCompleted => 3,
        EventKind::ConnectionClosed => 4,
        EventKind::DeviceFound => 5,
    }
}

/// Crate version as a NUL-terminated string.
#[no_mangle]
pub extern "C" fn edge_core_version() -> *const c_char {
    concat!(env!("CARGO_PKG_VERSION"), "\0").as_ptr() as *const c_char
}

/// Create a handle. `connect_type`: 0 TCP, 1 BROKER_PUBSUB, 2 HYBRID; `roles` is a
/// bit set (1 RECEIVE, 2 SEND, 4 SERVER). Writes the token to `out`.
#[no_mangle]
pub unsafe extern "C" fn edge_handle_create(
    id: *const c_char,
    connect_type_code: c_int,
    roles: c_int,
    topic: *const c_char,
    out: *mut EdgeToken,
) -> c_int {
    if out.is_null() {
        return ERROR_INVALID_PARAMETER;
    }
    let result = (|| {
        let id = text(id)?;
        let topic = if topic.is_null() { "" } else { text(topic)? };
        let kind = connect_type(connect_type_code)
            .ok_or_else(|| EdgeError::invalid("unknown connect type"))?;
        let roles = u8::try_from(roles).map_err(|_| EdgeError::invalid("bad roles"))?;
        EdgeHandle::create(id, kind, Roles::from_bits(roles), topic)
    })();
    register_handle(result, out)
}

/// Create a handle backed by the custom transport registered under `path`.
#[no_mangle]
pub unsafe extern "C" fn edge_handle_create_custom(
    id: *const c_char,
    path: *const c_char,
    roles: c_int,
    topic: *const c_char,
    out: *mut EdgeToken,
) -> c_int {
    if out.is_null() {
        return ERROR_INVALID_PARAMETER;
    }
    let result = (|| {
        let roles = u8::try_from(roles).map_err(|_| EdgeError::invalid("bad roles"))?;
        let topic = if topic.is_null() { "" } else { text(topic)? };
        EdgeHandle::create_custom(text(id)?, text(path)?, Roles::from_bits(roles), topic)
    })();
    register_handle(result, out)
}

unsafe fn register_handle(result: Result<EdgeHandle>, out: *mut EdgeToken) -> c_int {
    match result {
        Ok(h) => {
            let token = next_token();
            handles().insert(token, Arc::new(h));
            *out = token;
            ERROR_NONE
        }
        Err(e) => e.code(),
    }
}

/// Release a handle and invalidate its token.
#[no_mangle]
pub extern "C" fn edge_handle_release(h: EdgeToken) -> c_int {
    match handles().remove(&h) {
        Some((_, handle)) => code(handle.release()),
        None => ERROR_INVALID_PARAMETER,
    }
}

#[no_mangle]
pub extern "C" fn edge_handle_start(h: EdgeToken) -> c_int {
    code(handle(h).and_then(|h| h.start()))
}

#[no_mangle]
pub extern "C" fn edge_handle_stop(h: EdgeToken) -> c_int {
    code(handle(h).and_then(|h| h.stop()))
}

#[no_mangle]
pub unsafe extern "C" fn edge_handle_connect(h: EdgeToken, host: *const c_char, port: u16) -> c_int {
    code((|| handle(h)?.connect(text(host)?, port))())
}

#[no_mangle]
pub extern "C" fn edge_handle_disconnect(h: EdgeToken) -> c_int {
    code(handle(h).and_then(|h| h.disconnect()))
}

/// 1 when connected, 0 when not, negative on an invalid handle.
#[no_mangle]
pub extern "C" fn edge_handle_is_connected(h: EdgeToken) -> c_int {
    match handle(h) {
        Ok(h) => c_int::from(h.is_connected()),
        Err(e) => e.code(),
    }
}

#[no_mangle]
pub unsafe extern "C" fn edge_handle_set_info(
    h: EdgeToken,
    key: *const c_char,
    value: *const c_char,
) -> c_int {
    code((|| handle(h)?.set_info(text(key)?, text(value)?))())
}

/// Copy the value for `key` into `out`. Returns its length or a negative code.
#[no_mangle]
pub unsafe extern "C" fn edge_handle_get_info(
    h: EdgeToken,
    key: *const c_char,
    out: *mut c_char,
    out_len: usize,
) -> c_int {
    match (|| handle(h)?.get_info(text(key)?))() {
        Ok(value) => write_text(&value, out, out_len),
        Err(e) => e.code(),
    }
}

#[no_mangle]
pub extern "C" fn edge_handle_send(h: EdgeToken, d: EdgeToken) -> c_int {
    code((|| handle(h)?.send(&*data(d)?))())
}

struct UserPtr(*mut c_void);

// The host owns `user` and guarantees it may be used from the handle's threads.
unsafe impl Send for UserPtr {}
unsafe impl Sync for UserPtr {}

impl UserPtr {
    fn get(&self) -> *mut c_void {
        self.0
    }
}

/// Register `cb` with opaque `user`, or clear the callback when `cb` is null.
#[no_mangle]
pub extern "C" fn edge_handle_set_event_callback(
    h: EdgeToken,
    cb: Option<EdgeEventFn>,
    user: *mut c_void,
) -> c_int {
    let handle = match handle(h) {
        Ok(h) => h,
        Err(e) => return e.code(),
    };
    let Some(cb) = cb else {
        return code(handle.set_event_callback(None));
    };
    let user = UserPtr(user);
    let callback: EventCallback = Arc::new(move |event: &EdgeEvent| -> Result<()> {
        let payload = match event.kind() {
            EventKind::NewDataReceived => event.parse_new_data()?.serialize(),
            _ => event.payload().map(|b| b.to_vec()).unwrap_or_default(),
        };
        let rc = cb(event_code(event.kind()), payload.as_ptr(), payload.len(), user.get());
        if rc == ERROR_NONE {
            Ok(())
        } else {
            Err(EdgeError::Rejected(format!("callback returned {rc}")))
        }
    });
    code(handle.set_event_callback(Some(callback)))
}

#[no_mangle]
pub unsafe extern "C" fn edge_data_create(out: *mut EdgeToken) -> c_int {
    if out.is_null() {
        return ERROR_INVALID_PARAMETER;
    }
    *out = register_data(EdgeData::new());
    ERROR_NONE
}

fn register_data(d: EdgeData) -> EdgeToken {
    let token = next_token();
    datas().insert(token, Arc::new(d));
    token
}

#[no_mangle]
pub extern "C" fn edge_data_destroy(d: EdgeToken) -> c_int {
    match datas().remove(&d) {
        Some(_) => ERROR_NONE,
        None => ERROR_INVALID_PARAMETER,
    }
}

/// Append a copy of `len` bytes at `ptr`.
#[no_mangle]
pub unsafe extern "C" fn edge_data_add(d: EdgeToken, ptr: *const u8, len: usize) -> c_int {
    if ptr.is_null() || len == 0 {
        return ERROR_INVALID_PARAMETER;
    }
    let bytes = slice::from_raw_parts(ptr, len).to_vec();
    code(data(d).and_then(|d| d.add(bytes)))
}

#[no_mangle]
pub extern "C" fn edge_data_count(d: EdgeToken) -> c_int {
    match data(d) {
        Ok(d) => d.count() as c_int,
        Err(e) => e.code(),
    }
}

/// Copy buffer `index` into `out`. Returns bytes written or a negative code.
#[no_mangle]
pub unsafe extern "C" fn edge_data_get(
    d: EdgeToken,
    index: u32,
    out: *mut u8,
    out_len: usize,
) -> c_int {
    match data(d).and_then(|d| d.get(index as usize)) {
        Ok(bytes) => write_bytes(&bytes, out, out_len),
        Err(e) => e.code(),
    }
}

#[no_mangle]
pub unsafe extern "C" fn edge_data_set_info(
    d: EdgeToken,
    key: *const c_char,
    value: *const c_char,
) -> c_int {
    code((|| data(d)?.set_info(text(key)?, text(value)?))())
}

#[no_mangle]
pub unsafe extern "C" fn edge_data_get_info(
    d: EdgeToken,
    key: *const c_char,
    out: *mut c_char,
    out_len: usize,
) -> c_int {
    let value = (|| {
        let key = text(key)?;
        data(d)?
            .get_info(key)
            .ok_or_else(|| EdgeError::invalid(format!("no value for {key:?}")))
    })();
    match value {
        Ok(value) => write_text(&value, out, out_len),
        Err(e) => e.code(),
    }
}

/// Full-data serialization into `out`. Returns bytes written or a negative code.
#[no_mangle]
pub unsafe extern "C" fn edge_data_serialize(d: EdgeToken, out: *mut u8, out_len: usize) -> c_int {
    match data(d) {
        Ok(d) => write_bytes(&d.serialize(), out, out_len),
        Err(e) => e.code(),
    }
}

#[no_mangle]
pub unsafe extern "C" fn edge_data_deserialize(
    ptr: *const u8,
    len: usize,
    out: *mut EdgeToken,
) -> c_int {
    if ptr.is_null() || out.is_null() {
        return ERROR_INVALID_PARAMETER;
    }
    match EdgeData::deserialize(slice::from_raw_parts(ptr, len)) {
        Ok(d) => {
            *out = register_data(d);
            ERROR_NONE
        }
        Err(e) => e.code(),
    }
}
