//! C ABI over the eager runtime.
//!
//! Every object is created and destroyed by a paired `*New*`/`*Delete*` call. Fallible calls take
//! a `TF_Status*` that the caller must inspect afterwards. Serialized messages (`ServerDef`,
//! `FunctionDef`, graph nodes) are passed as JSON bytes.
//!
//! # Safety
//!
//! Pointer arguments must be null or point to live objects created by this library. Buffers
//! passed with a length must be readable for that many bytes. Strings are NUL-terminated UTF-8.
#![allow(non_camel_case_types, non_snake_case, clippy::missing_safety_doc)]

use std::ffi::{CStr, CString};
use std::os::raw::{c_char, c_int, c_void};
use std::sync::Arc;

use tfe_rs::eager::AttrValue;
use tfe_rs::graph::{Graph, GraphNode, Session};
use tfe_rs::status::{Code, Status, StatusResult};
use tfe_rs::tensor::{DType, PartialShape, Tensor, TensorShape};
use tfe_rs::{copy_to_device, execute, Context, ContextDevicePlacementPolicy, ContextOptions, Op, TensorHandle};

pub struct TF_Status {
    status: Option<Status>,
    message: CString,
}

pub struct TF_Tensor {
    tensor: Tensor,
}

pub struct TF_DeviceList {
    devices: Vec<(CString, CString)>,
}

pub struct TFE_ContextOptions {
    options: ContextOptions,
}

pub struct TFE_Context {
    context: Arc<Context>,
}

pub struct TFE_Op {
    op: Op,
}

pub struct TFE_TensorHandle {
    handle: TensorHandle,
    device_name: CString,
    backing_device_name: CString,
}

pub struct TF_Graph {
    graph: Graph,
}

pub struct TF_Session {
    session: Session,
}

fn c_string(value: &str) -> CString {
    CString::new(value).unwrap_or_default()
}

unsafe fn set_status(status: *mut TF_Status, result: StatusResult<()>) {
    let Some(status) = status.as_mut() else {
        return;
    };
    match result {
        Ok(()) => {
            status.status = None;
            status.message = CString::default();
        }
        Err(error) => {
            status.message = c_string(error.message());
            status.status = Some(error);
        }
    }
}

/// Stores the outcome in `status` and returns the value, or `fallback` on error.
unsafe fn report<T>(status: *mut TF_Status, result: StatusResult<T>, fallback: T) -> T {
    match result {
        Ok(value) => {
            set_status(status, Ok(()));
            value
        }
        Err(error) => {
            tracing::debug!(code = %error.code(), message = error.message(), "C API call failed");
            set_status(status, Err(error));
            fallback
        }
    }
}

unsafe fn deref<'a, T>(ptr: *const T) -> StatusResult<&'a T> {
    ptr.as_ref().ok_or_else(tfe_rs::eager::null_handle_error)
}

unsafe fn deref_mut<'a, T>(ptr: *mut T) -> StatusResult<&'a mut T> {
    ptr.as_mut().ok_or_else(tfe_rs::eager::null_handle_error)
}

unsafe fn str_arg<'a>(ptr: *const c_char, what: &str) -> StatusResult<&'a str> {
    if ptr.is_null() {
        return Err(Status::invalid_argument(format!("{what} must not be null")));
    }
    CStr::from_ptr(ptr)
        .to_str()
        .map_err(|_| Status::invalid_argument(format!("{what} is not valid UTF-8")))
}

unsafe fn bytes_arg<'a>(ptr: *const c_void, len: usize) -> StatusResult<&'a [u8]> {
    if len == 0 {
        return Ok(&[]);
    }
    if ptr.is_null() {
        return Err(Status::invalid_argument("buffer must not be null"));
    }
    Ok(std::slice::from_raw_parts(ptr as *const u8, len))
}

fn dtype_arg(tag: c_int) -> StatusResult<DType> {
    u32::try_from(tag)
        .ok()
        .and_then(DType::from_tag)
        .ok_or_else(|| Status::invalid_argument(format!("unsupported data type {tag}")))
}

fn into_raw_handle(handle: TensorHandle) -> *mut TFE_TensorHandle {
    Box::into_raw(Box::new(TFE_TensorHandle {
        device_name: c_string(handle.device_name()),
        backing_device_name: c_string(handle.backing_device_name()),
        handle,
    }))
}

// Status

#[no_mangle]
pub extern "C" fn TF_NewStatus() -> *mut TF_Status {
    Box::into_raw(Box::new(TF_Status {
        status: None,
        message: CString::default(),
    }))
}

#[no_mangle]
pub unsafe extern "C" fn TF_DeleteStatus(status: *mut TF_Status) {
    if !status.is_null() {
        drop(Box::from_raw(status));
    }
}

#[no_mangle]
pub unsafe extern "C" fn TF_GetCode(status: *const TF_Status) -> c_int {
    match status.as_ref().and_then(|status| status.status.as_ref()) {
        Some(error) => error.code().as_i32(),
        None => Code::Ok.as_i32(),
    }
}

#[no_mangle]
pub unsafe extern "C" fn TF_Message(status: *const TF_Status) -> *const c_char {
    match status.as_ref() {
        Some(status) => status.message.as_ptr(),
        None => std::ptr::null(),
    }
}

#[no_mangle]
pub unsafe extern "C" fn TF_SetStatus(status: *mut TF_Status, code: c_int, message: *const c_char) {
    let result = match Code::from_i32(code) {
        Some(Code::Ok) => Ok(()),
        Some(code) => Err(Status::new(
            code,
            str_arg(message, "message").unwrap_or_default(),
        )),
        None => Err(Status::unknown(format!("unknown status code {code}"))),
    };
    set_status(status, result);
}

// Tensors

/// Copies `len` bytes from `data` into a new host tensor.
#[no_mangle]
pub unsafe extern "C" fn TF_NewTensor(
    dtype: c_int,
    dims: *const i64,
    num_dims: c_int,
    data: *const c_void,
    len: usize,
    status: *mut TF_Status,
) -> *mut TF_Tensor {
    let result = (|| {
        let dtype = dtype_arg(dtype)?;
        let rank = usize::try_from(num_dims)
            .map_err(|_| Status::invalid_argument(format!("invalid rank {num_dims}")))?;
        let dims = if rank == 0 {
            Vec::new()
        } else if dims.is_null() {
            return Err(Status::invalid_argument("dims must not be null"));
        } else {
            std::slice::from_raw_parts(dims, rank)
                .iter()
                .map(|&dim| {
                    usize::try_from(dim)
                        .map_err(|_| Status::invalid_argument(format!("invalid dimension {dim}")))
                })
                .collect::<StatusResult<Vec<_>>>()?
        };
        let bytes = bytes_arg(data, len)?.to_vec();
        let tensor = Tensor::from_bytes(dtype, TensorShape::new(dims), bytes)?;
        Ok(Box::into_raw(Box::new(TF_Tensor { tensor })))
    })();
    report(status, result, std::ptr::null_mut())
}

#[no_mangle]
pub unsafe extern "C" fn TF_DeleteTensor(tensor: *mut TF_Tensor) {
    if !tensor.is_null() {
        drop(Box::from_raw(tensor));
    }
}

#[no_mangle]
pub unsafe extern "C" fn TF_TensorType(tensor: *const TF_Tensor) -> c_int {
    tensor.as_ref().map_or(0, |tensor| tensor.tensor.dtype().tag() as c_int)
}

#[no_mangle]
pub unsafe extern "C" fn TF_NumDims(tensor: *const TF_Tensor) -> c_int {
    tensor.as_ref().map_or(-1, |tensor| tensor.tensor.dims().len() as c_int)
}

#[no_mangle]
pub unsafe extern "C" fn TF_Dim(tensor: *const TF_Tensor, index: c_int) -> i64 {
    tensor
        .as_ref()
        .and_then(|tensor| tensor.tensor.dims().get(usize::try_from(index).ok()?).copied())
        .map_or(-1, |dim| dim as i64)
}

#[no_mangle]
pub unsafe extern "C" fn TF_TensorByteSize(tensor: *const TF_Tensor) -> usize {
    tensor.as_ref().map_or(0, |tensor| tensor.tensor.byte_size())
}

/// Borrowed pointer to the tensor's bytes, valid until the tensor is deleted.
#[no_mangle]
pub unsafe extern "C" fn TF_TensorData(tensor: *const TF_Tensor) -> *const c_void {
    tensor
        .as_ref()
        .map_or(std::ptr::null(), |tensor| tensor.tensor.bytes().as_ptr() as *const c_void)
}

// Context options

#[no_mangle]
pub extern "C" fn TFE_NewContextOptions() -> *mut TFE_ContextOptions {
    Box::into_raw(Box::new(TFE_ContextOptions {
        options: ContextOptions::default(),
    }))
}

#[no_mangle]
pub unsafe extern "C" fn TFE_DeleteContextOptions(options: *mut TFE_ContextOptions) {
    if !options.is_null() {
        drop(Box::from_raw(options));
    }
}

#[no_mangle]
pub unsafe extern "C" fn TFE_ContextOptionsSetAsync(options: *mut TFE_ContextOptions, enable: u8) {
    if let Some(options) = options.as_mut() {
        options.options.async_mode = Some(enable != 0);
    }
}

#[no_mangle]
pub unsafe extern "C" fn TFE_ContextOptionsSetDevicePlacementPolicy(options: *mut TFE_ContextOptions, policy: c_int) {
    if let Some(options) = options.as_mut() {
        options.options.placement_policy = ContextDevicePlacementPolicy::from_i32(policy);
    }
}

// Context

#[no_mangle]
pub unsafe extern "C" fn TFE_NewContext(options: *const TFE_ContextOptions, status: *mut TF_Status) -> *mut TFE_Context {
    tfe_rs::logging::init_logging();
    tfe_rs_backend_interpreter::register_interpreter_compiler();
    let result = deref(options)
        .and_then(|options| Context::new(options.options.clone()))
        .map(|context| Box::into_raw(Box::new(TFE_Context { context })));
    report(status, result, std::ptr::null_mut())
}

#[no_mangle]
pub unsafe extern "C" fn TFE_DeleteContext(context: *mut TFE_Context) {
    if !context.is_null() {
        drop(Box::from_raw(context));
    }
}

#[no_mangle]
pub unsafe extern "C" fn TFE_ContextListDevices(context: *mut TFE_Context, status: *mut TF_Status) -> *mut TF_DeviceList {
    let result = deref(context).map(|context| {
        let devices = context
            .context
            .list_devices()
            .into_iter()
            .map(|device| (c_string(&device.name), c_string(&device.device_type)))
            .collect();
        Box::into_raw(Box::new(TF_DeviceList { devices }))
    });
    report(status, result, std::ptr::null_mut())
}

#[no_mangle]
pub unsafe extern "C" fn TF_DeleteDeviceList(list: *mut TF_DeviceList) {
    if !list.is_null() {
        drop(Box::from_raw(list));
    }
}

#[no_mangle]
pub unsafe extern "C" fn TF_DeviceListCount(list: *const TF_DeviceList) -> c_int {
    list.as_ref().map_or(-1, |list| list.devices.len() as c_int)
}

unsafe fn device_list_entry<'a>(
    list: *const TF_DeviceList,
    index: c_int,
) -> StatusResult<&'a (CString, CString)> {
    let list = deref(list)?;
    usize::try_from(index)
        .ok()
        .and_then(|index| list.devices.get(index))
        .ok_or_else(|| {
            Status::invalid_argument(format!(
                "index out of bounds: {index} not in [0, {})",
                list.devices.len()
            ))
        })
}

#[no_mangle]
pub unsafe extern "C" fn TF_DeviceListName(
    list: *const TF_DeviceList,
    index: c_int,
    status: *mut TF_Status,
) -> *const c_char {
    let result = device_list_entry(list, index).map(|(name, _)| name.as_ptr());
    report(status, result, std::ptr::null())
}

#[no_mangle]
pub unsafe extern "C" fn TF_DeviceListType(
    list: *const TF_DeviceList,
    index: c_int,
    status: *mut TF_Status,
) -> *const c_char {
    let result = device_list_entry(list, index).map(|(_, device_type)| device_type.as_ptr());
    report(status, result, std::ptr::null())
}

/// Installs or replaces the cluster topology from a JSON-encoded `ServerDef`.
#[no_mangle]
pub unsafe extern "C" fn TFE_ContextSetServerDef(
    context: *mut TFE_Context,
    keep_alive_secs: c_int,
    proto: *const c_void,
    proto_len: usize,
    status: *mut TF_Status,
) {
    let result = deref(context).and_then(|context| {
        context
            .context
            .set_server_def_json(i64::from(keep_alive_secs), bytes_arg(proto, proto_len)?)
    });
    report(status, result, ())
}

#[no_mangle]
pub unsafe extern "C" fn TFE_ContextAddFunctionDef(
    context: *mut TFE_Context,
    serialized_function_def: *const c_char,
    size: usize,
    status: *mut TF_Status,
) {
    let result = deref(context).and_then(|context| {
        context
            .context
            .add_function_def_json(bytes_arg(serialized_function_def as *const c_void, size)?)
    });
    report(status, result, ())
}

#[no_mangle]
pub unsafe extern "C" fn TFE_ContextSetAsyncForThread(context: *mut TFE_Context, enable: u8, status: *mut TF_Status) {
    let result = deref(context).map(|context| context.context.set_async_for_thread(enable != 0));
    report(status, result, ())
}

#[no_mangle]
pub unsafe extern "C" fn TFE_ContextSetThreadLocalDevicePlacementPolicy(context: *mut TFE_Context, policy: c_int) {
    let Some(context) = context.as_ref() else {
        return;
    };
    match ContextDevicePlacementPolicy::from_i32(policy) {
        Some(policy) => context.context.set_thread_local_placement_policy(policy),
        None => tracing::warn!(policy, "ignoring unknown device placement policy"),
    }
}

#[no_mangle]
pub unsafe extern "C" fn TFE_ContextGetDevicePlacementPolicy(context: *mut TFE_Context) -> c_int {
    context
        .as_ref()
        .map_or(-1, |context| context.context.placement_policy() as c_int)
}

/// Blocks until every queued op has finished and reports the first error, if any.
#[no_mangle]
pub unsafe extern "C" fn TFE_ContextAsyncWait(context: *mut TFE_Context, status: *mut TF_Status) {
    let result = deref(context).and_then(|context| context.context.async_wait());
    report(status, result, ())
}

#[no_mangle]
pub unsafe extern "C" fn TFE_ContextAsyncClearError(context: *mut TFE_Context) {
    if let Some(context) = context.as_ref() {
        context.context.async_clear_error();
    }
}

// Tensor handles

#[no_mangle]
pub unsafe extern "C" fn TFE_NewTensorHandle(
    context: *mut TFE_Context,
    tensor: *const TF_Tensor,
    status: *mut TF_Status,
) -> *mut TFE_TensorHandle {
    let result = (|| {
        let tensor = deref(tensor)?;
        let context = deref(context)?;
        Ok(into_raw_handle(TensorHandle::from_tensor(
            &context.context,
            tensor.tensor.clone(),
        )))
    })();
    report(status, result, std::ptr::null_mut())
}

#[no_mangle]
pub unsafe extern "C" fn TFE_DeleteTensorHandle(handle: *mut TFE_TensorHandle) {
    if !handle.is_null() {
        drop(Box::from_raw(handle));
    }
}

#[no_mangle]
pub unsafe extern "C" fn TFE_TensorHandleResolve(handle: *mut TFE_TensorHandle, status: *mut TF_Status) -> *mut TF_Tensor {
    let result = deref(handle)
        .and_then(|handle| handle.handle.resolve())
        .map(|tensor| Box::into_raw(Box::new(TF_Tensor { tensor })));
    report(status, result, std::ptr::null_mut())
}

#[no_mangle]
pub unsafe extern "C" fn TFE_TensorHandleDataType(handle: *mut TFE_TensorHandle) -> c_int {
    handle
        .as_ref()
        .map_or(0, |handle| handle.handle.dtype().tag() as c_int)
}

#[no_mangle]
pub unsafe extern "C" fn TFE_TensorHandleNumDims(handle: *mut TFE_TensorHandle, status: *mut TF_Status) -> c_int {
    let result = deref(handle)
        .and_then(|handle| handle.handle.num_dims())
        .map(|rank| rank as c_int);
    report(status, result, -1)
}

#[no_mangle]
pub unsafe extern "C" fn TFE_TensorHandleDim(
    handle: *mut TFE_TensorHandle,
    dim_index: c_int,
    status: *mut TF_Status,
) -> i64 {
    let result = deref(handle).and_then(|handle| {
        let index = usize::try_from(dim_index).map_err(|_| {
            Status::invalid_argument(format!(
                "Expected a non-negative dimension index, got {dim_index}"
            ))
        })?;
        handle.handle.dim(index).map(|dim| dim as i64)
    });
    report(status, result, -1)
}

#[no_mangle]
pub unsafe extern "C" fn TFE_TensorHandleDeviceName(handle: *mut TFE_TensorHandle, status: *mut TF_Status) -> *const c_char {
    let result = deref(handle).map(|handle| handle.device_name.as_ptr());
    report(status, result, std::ptr::null())
}

#[no_mangle]
pub unsafe extern "C" fn TFE_TensorHandleBackingDeviceName(
    handle: *mut TFE_TensorHandle,
    status: *mut TF_Status,
) -> *const c_char {
    let result = deref(handle).map(|handle| handle.backing_device_name.as_ptr());
    report(status, result, std::ptr::null())
}

#[no_mangle]
pub unsafe extern "C" fn TFE_TensorHandleCopySharingTensor(
    handle: *mut TFE_TensorHandle,
    status: *mut TF_Status,
) -> *mut TFE_TensorHandle {
    let result = deref(handle).map(|handle| into_raw_handle(handle.handle.copy_sharing_tensor()));
    report(status, result, std::ptr::null_mut())
}

#[no_mangle]
pub unsafe extern "C" fn TFE_TensorHandleCopyToDevice(
    handle: *mut TFE_TensorHandle,
    context: *mut TFE_Context,
    device_name: *const c_char,
    status: *mut TF_Status,
) -> *mut TFE_TensorHandle {
    let result = (|| {
        let handle = deref(handle)?;
        let context = deref(context)?;
        let device_name = str_arg(device_name, "device name")?;
        copy_to_device(&handle.handle, &context.context, device_name).map(into_raw_handle)
    })();
    report(status, result, std::ptr::null_mut())
}

// Ops

#[no_mangle]
pub unsafe extern "C" fn TFE_NewOp(
    context: *mut TFE_Context,
    op_or_function_name: *const c_char,
    status: *mut TF_Status,
) -> *mut TFE_Op {
    let result = (|| {
        let context = deref(context)?;
        let name = str_arg(op_or_function_name, "op name")?;
        let op = Op::new(&context.context, name)?;
        Ok(Box::into_raw(Box::new(TFE_Op { op })))
    })();
    report(status, result, std::ptr::null_mut())
}

#[no_mangle]
pub unsafe extern "C" fn TFE_DeleteOp(op: *mut TFE_Op) {
    if !op.is_null() {
        drop(Box::from_raw(op));
    }
}

#[no_mangle]
pub unsafe extern "C" fn TFE_OpSetDevice(op: *mut TFE_Op, device_name: *const c_char, status: *mut TF_Status) {
    let result = (|| {
        let op = deref_mut(op)?;
        op.op.set_device(str_arg(device_name, "device name")?)
    })();
    report(status, result, ())
}

#[no_mangle]
pub unsafe extern "C" fn TFE_OpAddInput(op: *mut TFE_Op, input: *mut TFE_TensorHandle, status: *mut TF_Status) {
    let result = (|| {
        let op = deref_mut(op)?;
        let input = deref(input)?;
        op.op.add_input(&input.handle)
    })();
    report(status, result, ())
}

unsafe fn with_attr(op: *mut TFE_Op, attr_name: *const c_char, f: impl FnOnce(&mut Op, &str)) {
    if let (Some(op), Ok(name)) = (op.as_mut(), str_arg(attr_name, "attribute name")) {
        f(&mut op.op, name);
    }
}

#[no_mangle]
pub unsafe extern "C" fn TFE_OpSetAttrInt(op: *mut TFE_Op, attr_name: *const c_char, value: i64) {
    with_attr(op, attr_name, |op, name| op.set_attr_int(name, value));
}

#[no_mangle]
pub unsafe extern "C" fn TFE_OpSetAttrFloat(op: *mut TFE_Op, attr_name: *const c_char, value: f32) {
    with_attr(op, attr_name, |op, name| op.set_attr_float(name, value));
}

#[no_mangle]
pub unsafe extern "C" fn TFE_OpSetAttrBool(op: *mut TFE_Op, attr_name: *const c_char, value: u8) {
    with_attr(op, attr_name, |op, name| op.set_attr_bool(name, value != 0));
}

#[no_mangle]
pub unsafe extern "C" fn TFE_OpSetAttrType(op: *mut TFE_Op, attr_name: *const c_char, value: c_int) {
    match dtype_arg(value) {
        Ok(dtype) => with_attr(op, attr_name, |op, name| op.set_attr_type(name, dtype)),
        Err(error) => tracing::warn!(error = %error, "ignoring type attribute"),
    }
}

#[no_mangle]
pub unsafe extern "C" fn TFE_OpSetAttrString(
    op: *mut TFE_Op,
    attr_name: *const c_char,
    value: *const c_void,
    length: usize,
) {
    let Ok(bytes) = bytes_arg(value, length) else {
        return;
    };
    let value = String::from_utf8_lossy(bytes).into_owned();
    with_attr(op, attr_name, |op, name| op.set_attr_string(name, value));
}

#[no_mangle]
pub unsafe extern "C" fn TFE_OpSetAttrFunctionName(
    op: *mut TFE_Op,
    attr_name: *const c_char,
    data: *const c_char,
    length: usize,
) {
    let Ok(bytes) = bytes_arg(data as *const c_void, length) else {
        return;
    };
    let function = String::from_utf8_lossy(bytes).into_owned();
    with_attr(op, attr_name, |op, name| op.set_attr_function_name(name, function));
}

/// `num_dims == -1` sets a shape of unknown rank; `-1` dimensions are unknown.
#[no_mangle]
pub unsafe extern "C" fn TFE_OpSetAttrShape(
    op: *mut TFE_Op,
    attr_name: *const c_char,
    dims: *const i64,
    num_dims: c_int,
    status: *mut TF_Status,
) {
    let result = (|| {
        let op = deref_mut(op)?;
        let name = str_arg(attr_name, "attribute name")?;
        let shape = match usize::try_from(num_dims) {
            Err(_) => PartialShape::from_signed(None),
            Ok(0) => PartialShape::from_signed(Some(&[])),
            Ok(_) if dims.is_null() => return Err(Status::invalid_argument("dims must not be null")),
            Ok(rank) => PartialShape::from_signed(Some(std::slice::from_raw_parts(dims, rank))),
        };
        op.op.set_attr_shape(name, shape);
        Ok(())
    })();
    report(status, result, ())
}

#[no_mangle]
pub unsafe extern "C" fn TFE_OpSetAttrTensor(
    op: *mut TFE_Op,
    attr_name: *const c_char,
    tensor: *const TF_Tensor,
    status: *mut TF_Status,
) {
    let result = (|| {
        let op = deref_mut(op)?;
        let tensor = deref(tensor)?;
        let name = str_arg(attr_name, "attribute name")?;
        op.op.set_attr_tensor(name, tensor.tensor.clone());
        Ok(())
    })();
    report(status, result, ())
}

#[no_mangle]
pub unsafe extern "C" fn TFE_OpSetAttrIntList(
    op: *mut TFE_Op,
    attr_name: *const c_char,
    values: *const i64,
    num_values: c_int,
) {
    let count = usize::try_from(num_values).unwrap_or(0);
    let values = if count == 0 || values.is_null() {
        Vec::new()
    } else {
        std::slice::from_raw_parts(values, count)
            .iter()
            .map(|&value| AttrValue::Int(value))
            .collect()
    };
    with_attr(op, attr_name, |op, name| op.set_attr_list(name, values));
}

#[no_mangle]
pub unsafe extern "C" fn TFE_OpSetAttrTypeList(
    op: *mut TFE_Op,
    attr_name: *const c_char,
    values: *const c_int,
    num_values: c_int,
) {
    let count = usize::try_from(num_values).unwrap_or(0);
    let types = if count == 0 || values.is_null() {
        Ok(Vec::new())
    } else {
        std::slice::from_raw_parts(values, count)
            .iter()
            .map(|&tag| dtype_arg(tag).map(AttrValue::Type))
            .collect::<StatusResult<Vec<_>>>()
    };
    match types {
        Ok(types) => with_attr(op, attr_name, |op, name| op.set_attr_list(name, types)),
        Err(error) => tracing::warn!(error = %error, "ignoring type list attribute"),
    }
}

/// Runs `op`. On entry `*num_retvals` is the capacity of `retvals`; on success it holds the
/// number of handles written.
#[no_mangle]
pub unsafe extern "C" fn TFE_Execute(
    op: *mut TFE_Op,
    retvals: *mut *mut TFE_TensorHandle,
    num_retvals: *mut c_int,
    status: *mut TF_Status,
) {
    let result = (|| {
        let op = deref(op)?;
        let capacity = deref_mut(num_retvals)?;
        let expected = op.op.output_types()?.len();
        if expected > usize::try_from(*capacity).unwrap_or(0) {
            return Err(Status::invalid_argument(format!(
                "Expected at most {} outputs, op {} produces {}",
                *capacity,
                op.op.name(),
                expected
            )));
        }
        if expected > 0 && retvals.is_null() {
            return Err(Status::invalid_argument("retvals must not be null"));
        }
        let outputs = execute(&op.op)?;
        if outputs.len() != expected {
            return Err(Status::internal(format!(
                "op {} produced {} outputs, expected {expected}",
                op.op.name(),
                outputs.len()
            )));
        }
        *capacity = outputs.len() as c_int;
        for (index, output) in outputs.into_iter().enumerate() {
            *retvals.add(index) = into_raw_handle(output);
        }
        Ok(())
    })();
    report(status, result, ())
}

// Graphs and sessions

#[no_mangle]
pub extern "C" fn TF_NewGraph() -> *mut TF_Graph {
    Box::into_raw(Box::new(TF_Graph { graph: Graph::new() }))
}

/// Requests deletion. The graph itself is destroyed once its last session closes.
#[no_mangle]
pub unsafe extern "C" fn TF_DeleteGraph(graph: *mut TF_Graph) {
    if !graph.is_null() {
        let graph = Box::from_raw(graph);
        graph.graph.request_delete();
    }
}

/// Adds a JSON-encoded node to the graph.
#[no_mangle]
pub unsafe extern "C" fn TF_GraphAddNode(
    graph: *mut TF_Graph,
    node: *const c_void,
    len: usize,
    status: *mut TF_Status,
) {
    let result = (|| {
        let graph = deref(graph)?;
        let node: GraphNode = serde_json::from_slice(bytes_arg(node, len)?)?;
        graph.graph.add_node(node)
    })();
    report(status, result, ())
}

#[no_mangle]
pub unsafe extern "C" fn TF_GraphSetNodeDevice(
    graph: *mut TF_Graph,
    node: *const c_char,
    device: *const c_char,
    status: *mut TF_Status,
) {
    let result = (|| {
        let graph = deref(graph)?;
        graph
            .graph
            .set_device(str_arg(node, "node name")?, str_arg(device, "device name")?)
    })();
    report(status, result, ())
}

#[no_mangle]
pub unsafe extern "C" fn TF_NewSession(
    graph: *mut TF_Graph,
    context: *mut TFE_Context,
    status: *mut TF_Status,
) -> *mut TF_Session {
    let result = (|| {
        let graph = deref(graph)?;
        let context = deref(context)?;
        let session = Session::new(&graph.graph, &context.context)?;
        Ok(Box::into_raw(Box::new(TF_Session { session })))
    })();
    report(status, result, std::ptr::null_mut())
}

#[no_mangle]
pub unsafe extern "C" fn TF_CloseSession(session: *mut TF_Session, status: *mut TF_Status) {
    let result = deref_mut(session).map(|session| session.session.close());
    report(status, result, ())
}

#[no_mangle]
pub unsafe extern "C" fn TF_DeleteSession(session: *mut TF_Session, status: *mut TF_Status) {
    let result = if session.is_null() {
        Err(tfe_rs::eager::null_handle_error())
    } else {
        drop(Box::from_raw(session));
        Ok(())
    };
    report(status, result, ())
}

/// Runs `fetches` with `inputs` fed to the named nodes, writing one new handle per fetch.
#[no_mangle]
pub unsafe extern "C" fn TF_SessionRun(
    session: *mut TF_Session,
    input_names: *const *const c_char,
    inputs: *const *mut TFE_TensorHandle,
    num_inputs: c_int,
    fetch_names: *const *const c_char,
    outputs: *mut *mut TFE_TensorHandle,
    num_fetches: c_int,
    status: *mut TF_Status,
) {
    let result = (|| {
        let session = deref_mut(session)?;
        let num_inputs = usize::try_from(num_inputs).unwrap_or(0);
        let num_fetches = usize::try_from(num_fetches).unwrap_or(0);
        if (num_inputs > 0 && (input_names.is_null() || inputs.is_null()))
            || (num_fetches > 0 && (fetch_names.is_null() || outputs.is_null()))
        {
            return Err(tfe_rs::eager::null_handle_error());
        }
        let mut feeds = Vec::with_capacity(num_inputs);
        for index in 0..num_inputs {
            let name = str_arg(*input_names.add(index), "input name")?;
            let handle = deref(*inputs.add(index))?;
            feeds.push((name, handle.handle.clone()));
        }
        let fetches = (0..num_fetches)
            .map(|index| str_arg(*fetch_names.add(index), "fetch name"))
            .collect::<StatusResult<Vec<_>>>()?;
        let results = session.session.run(&feeds, &fetches)?;
        for (index, handle) in results.into_iter().enumerate() {
            *outputs.add(index) = into_raw_handle(handle);
        }
        Ok(())
    })();
    report(status, result, ())
}
