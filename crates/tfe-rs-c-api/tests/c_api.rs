use std::ffi::{CStr, CString};
use std::os::raw::{c_int, c_void};

use tfe_rs::status::Code;
use tfe_rs::tensor::DType;
use tfe_rs_c_api::*;

struct Status(*mut TF_Status);

impl Status {
    fn new() -> Self {
        Status(TF_NewStatus())
    }

    fn code(&self) -> c_int {
        unsafe { TF_GetCode(self.0) }
    }

    fn message(&self) -> String {
        unsafe { CStr::from_ptr(TF_Message(self.0)) }
            .to_string_lossy()
            .into_owned()
    }

    fn assert_ok(&self) {
        assert_eq!(self.code(), Code::Ok.as_i32(), "{}", self.message());
    }
}

impl Drop for Status {
    fn drop(&mut self) {
        unsafe { TF_DeleteStatus(self.0) };
    }
}

unsafe fn new_context(status: &Status) -> *mut TFE_Context {
    let options = TFE_NewContextOptions();
    let context = TFE_NewContext(options, status.0);
    TFE_DeleteContextOptions(options);
    status.assert_ok();
    context
}

unsafe fn float_handle(context: *mut TFE_Context, dims: &[i64], values: &[f32], status: &Status) -> *mut TFE_TensorHandle {
    let tensor = TF_NewTensor(
        DType::F32.tag() as c_int,
        dims.as_ptr(),
        dims.len() as c_int,
        values.as_ptr() as *const c_void,
        std::mem::size_of_val(values),
        status.0,
    );
    status.assert_ok();
    let handle = TFE_NewTensorHandle(context, tensor, status.0);
    TF_DeleteTensor(tensor);
    status.assert_ok();
    handle
}

unsafe fn resolve_floats(handle: *mut TFE_TensorHandle, status: &Status) -> Vec<f32> {
    let tensor = TFE_TensorHandleResolve(handle, status.0);
    status.assert_ok();
    let len = TF_TensorByteSize(tensor) / 4;
    let data = std::slice::from_raw_parts(TF_TensorData(tensor) as *const f32, len).to_vec();
    TF_DeleteTensor(tensor);
    data
}

#[test]
fn null_handles_report_invalid_argument() {
    let status = Status::new();
    unsafe {
        let dims = TFE_TensorHandleNumDims(std::ptr::null_mut(), status.0);
        assert_eq!(dims, -1);
        assert_eq!(status.code(), Code::InvalidArgument.as_i32());
        assert_eq!(status.message(), "The passed in handle is a nullptr");

        let resolved = TFE_TensorHandleResolve(std::ptr::null_mut(), status.0);
        assert!(resolved.is_null());
        assert_eq!(status.message(), "The passed in handle is a nullptr");
    }
}

#[test]
fn lists_local_devices() {
    let status = Status::new();
    unsafe {
        let context = new_context(&status);
        let devices = TFE_ContextListDevices(context, status.0);
        status.assert_ok();
        let count = TF_DeviceListCount(devices);
        assert!(count >= 2);

        let mut types = Vec::new();
        for index in 0..count {
            let name = CStr::from_ptr(TF_DeviceListName(devices, index, status.0));
            status.assert_ok();
            assert!(name.to_str().unwrap().starts_with("/job:localhost/replica:0/task:0/device:"));
            types.push(
                CStr::from_ptr(TF_DeviceListType(devices, index, status.0))
                    .to_string_lossy()
                    .into_owned(),
            );
        }
        assert!(types.iter().any(|t| t == "CPU"));
        assert!(types.iter().any(|t| t == "XLA_CPU"));

        TF_DeviceListName(devices, count, status.0);
        assert_eq!(status.code(), Code::InvalidArgument.as_i32());

        TF_DeleteDeviceList(devices);
        TFE_DeleteContext(context);
    }
}

#[test]
fn executes_matmul_through_the_abi() {
    let status = Status::new();
    unsafe {
        let context = new_context(&status);
        let a = float_handle(context, &[2, 2], &[1.0, 2.0, 3.0, 4.0], &status);

        assert_eq!(TFE_TensorHandleNumDims(a, status.0), 2);
        assert_eq!(TFE_TensorHandleDim(a, 1, status.0), 2);
        assert_eq!(TFE_TensorHandleDataType(a), DType::F32.tag() as c_int);

        let name = CString::new("MatMul").unwrap();
        let op = TFE_NewOp(context, name.as_ptr(), status.0);
        status.assert_ok();
        TFE_OpAddInput(op, a, status.0);
        status.assert_ok();
        TFE_OpAddInput(op, a, status.0);
        status.assert_ok();

        let mut retvals = [std::ptr::null_mut(); 2];
        let mut num_retvals: c_int = 2;
        TFE_Execute(op, retvals.as_mut_ptr(), &mut num_retvals, status.0);
        status.assert_ok();
        assert_eq!(num_retvals, 1);

        assert_eq!(resolve_floats(retvals[0], &status), vec![7.0, 10.0, 15.0, 22.0]);

        TFE_DeleteTensorHandle(retvals[0]);
        TFE_DeleteOp(op);
        TFE_DeleteTensorHandle(a);
        TFE_DeleteContext(context);
    }
}

#[test]
fn unknown_op_is_not_found() {
    let status = Status::new();
    unsafe {
        let context = new_context(&status);
        let name = CString::new("NoSuchOp").unwrap();
        let op = TFE_NewOp(context, name.as_ptr(), status.0);
        assert!(op.is_null());
        assert_eq!(status.code(), Code::NotFound.as_i32());
        assert!(status.message().contains("NoSuchOp"));
        TFE_DeleteContext(context);
    }
}

#[test]
fn copies_between_devices_and_shares_on_same_device() {
    let status = Status::new();
    unsafe {
        let context = new_context(&status);
        let host = float_handle(context, &[3], &[1.0, 2.0, 3.0], &status);

        let target = CString::new("/job:localhost/replica:0/task:0/device:XLA_CPU:0").unwrap();
        let copied = TFE_TensorHandleCopyToDevice(host, context, target.as_ptr(), status.0);
        status.assert_ok();
        let device = CStr::from_ptr(TFE_TensorHandleDeviceName(copied, status.0));
        assert_eq!(device.to_bytes(), target.as_bytes());
        let backing = CStr::from_ptr(TFE_TensorHandleBackingDeviceName(copied, status.0));
        assert_eq!(backing.to_bytes(), target.as_bytes());
        assert_eq!(resolve_floats(copied, &status), vec![1.0, 2.0, 3.0]);

        let shared = TFE_TensorHandleCopySharingTensor(copied, status.0);
        status.assert_ok();
        assert_eq!(resolve_floats(shared, &status), vec![1.0, 2.0, 3.0]);

        let bogus = CString::new("/device:GPU:7").unwrap();
        let missing = TFE_TensorHandleCopyToDevice(host, context, bogus.as_ptr(), status.0);
        assert!(missing.is_null());
        assert_eq!(status.code(), Code::InvalidArgument.as_i32());
        assert!(status.message().contains("unknown device"));

        TFE_DeleteTensorHandle(shared);
        TFE_DeleteTensorHandle(copied);
        TFE_DeleteTensorHandle(host);
        TFE_DeleteContext(context);
    }
}

#[test]
fn set_server_def_adds_remote_devices() {
    let status = Status::new();
    unsafe {
        let context = new_context(&status);
        let server_def = br#"{
            "cluster": {"job": [{"name": "localhost", "tasks": {"0": "127.0.0.1:2222", "1": "127.0.0.1:2223"}}]},
            "job_name": "localhost",
            "task_index": 0
        }"#;
        TFE_ContextSetServerDef(
            context,
            0,
            server_def.as_ptr() as *const c_void,
            server_def.len(),
            status.0,
        );
        status.assert_ok();

        let devices = TFE_ContextListDevices(context, status.0);
        let names: Vec<String> = (0..TF_DeviceListCount(devices))
            .map(|index| {
                CStr::from_ptr(TF_DeviceListName(devices, index, status.0))
                    .to_string_lossy()
                    .into_owned()
            })
            .collect();
        assert!(names.iter().any(|name| name.contains("/task:1/")));
        TF_DeleteDeviceList(devices);

        let garbage = b"not json";
        TFE_ContextSetServerDef(context, 0, garbage.as_ptr() as *const c_void, garbage.len(), status.0);
        assert_eq!(status.code(), Code::InvalidArgument.as_i32());

        TFE_DeleteContext(context);
    }
}

#[test]
fn registered_function_runs_by_name() {
    let status = Status::new();
    unsafe {
        let context = new_context(&status);
        let function_def = br#"{
            "signature": {
                "name": "Square",
                "input_arg": [{"name": "x", "type": "float"}],
                "output_arg": [{"name": "y", "type": "float"}]
            },
            "node_def": [{"name": "mul", "op": "Mul", "input": ["x", "x"]}],
            "ret": {"y": "mul:z:0"}
        }"#;
        TFE_ContextAddFunctionDef(
            context,
            function_def.as_ptr() as *const _,
            function_def.len(),
            status.0,
        );
        status.assert_ok();

        let x = float_handle(context, &[2], &[3.0, -2.0], &status);
        let name = CString::new("Square").unwrap();
        let op = TFE_NewOp(context, name.as_ptr(), status.0);
        status.assert_ok();
        TFE_OpAddInput(op, x, status.0);
        let mut retval = std::ptr::null_mut();
        let mut num_retvals: c_int = 1;
        TFE_Execute(op, &mut retval, &mut num_retvals, status.0);
        status.assert_ok();
        assert_eq!(resolve_floats(retval, &status), vec![9.0, 4.0]);

        TFE_DeleteTensorHandle(retval);
        TFE_DeleteOp(op);
        TFE_DeleteTensorHandle(x);
        TFE_DeleteContext(context);
    }
}

#[test]
fn async_errors_surface_on_wait_and_clear() {
    let status = Status::new();
    unsafe {
        let options = TFE_NewContextOptions();
        TFE_ContextOptionsSetAsync(options, 1);
        let context = TFE_NewContext(options, status.0);
        TFE_DeleteContextOptions(options);
        status.assert_ok();

        let a = float_handle(context, &[2, 2], &[1.0, 2.0, 3.0, 4.0], &status);
        let b = float_handle(context, &[3, 2], &[1.0; 6], &status);
        let name = CString::new("MatMul").unwrap();
        let op = TFE_NewOp(context, name.as_ptr(), status.0);
        TFE_OpAddInput(op, a, status.0);
        TFE_OpAddInput(op, b, status.0);
        let mut retval = std::ptr::null_mut();
        let mut num_retvals: c_int = 1;
        TFE_Execute(op, &mut retval, &mut num_retvals, status.0);
        status.assert_ok();

        TFE_ContextAsyncWait(context, status.0);
        assert_eq!(status.code(), Code::InvalidArgument.as_i32());
        assert!(status.message().contains("Matrix size-incompatible"));

        TFE_ContextAsyncClearError(context);
        TFE_ContextAsyncWait(context, status.0);
        status.assert_ok();

        TFE_DeleteTensorHandle(retval);
        TFE_DeleteOp(op);
        TFE_DeleteTensorHandle(b);
        TFE_DeleteTensorHandle(a);
        TFE_DeleteContext(context);
    }
}

#[test]
fn too_few_retvals_fail_before_dispatch() {
    let status = Status::new();
    unsafe {
        let options = TFE_NewContextOptions();
        TFE_ContextOptionsSetAsync(options, 1);
        let context = TFE_NewContext(options, status.0);
        TFE_DeleteContextOptions(options);
        status.assert_ok();

        // Would poison the queue if it were ever enqueued.
        let a = float_handle(context, &[2, 2], &[1.0, 2.0, 3.0, 4.0], &status);
        let b = float_handle(context, &[3, 2], &[1.0; 6], &status);
        let name = CString::new("MatMul").unwrap();
        let op = TFE_NewOp(context, name.as_ptr(), status.0);
        TFE_OpAddInput(op, a, status.0);
        TFE_OpAddInput(op, b, status.0);
        let mut retval = std::ptr::null_mut();
        let mut num_retvals: c_int = 0;
        TFE_Execute(op, &mut retval, &mut num_retvals, status.0);
        assert_eq!(status.code(), Code::InvalidArgument.as_i32());
        assert_eq!(status.message(), "Expected at most 0 outputs, op MatMul produces 1");
        assert_eq!(num_retvals, 0);
        assert!(retval.is_null());

        TFE_ContextAsyncWait(context, status.0);
        status.assert_ok();

        TFE_DeleteOp(op);
        TFE_DeleteTensorHandle(b);
        TFE_DeleteTensorHandle(a);
        TFE_DeleteContext(context);
    }
}

#[test]
fn graph_sessions_run_and_reject_mutation() {
    let status = Status::new();
    unsafe {
        let context = new_context(&status);
        let graph = TF_NewGraph();
        for node in [
            br#"{"name": "x", "op": "Placeholder"}"#.as_slice(),
            br#"{"name": "neg", "op": "Neg", "inputs": ["x"]}"#.as_slice(),
        ] {
            TF_GraphAddNode(graph, node.as_ptr() as *const c_void, node.len(), status.0);
            status.assert_ok();
        }

        let session = TF_NewSession(graph, context, status.0);
        status.assert_ok();
        let x = float_handle(context, &[2], &[1.0, -4.0], &status);
        let feed = CString::new("x").unwrap();
        let fetch = CString::new("neg").unwrap();
        let mut output = std::ptr::null_mut();
        TF_SessionRun(session, &feed.as_ptr(), &x, 1, &fetch.as_ptr(), &mut output, 1, status.0);
        status.assert_ok();
        assert_eq!(resolve_floats(output, &status), vec![-1.0, 4.0]);
        TFE_DeleteTensorHandle(output);

        let device = CString::new("/device:CPU:0").unwrap();
        TF_GraphSetNodeDevice(graph, fetch.as_ptr(), device.as_ptr(), status.0);
        status.assert_ok();
        let mut output = std::ptr::null_mut();
        TF_SessionRun(session, &feed.as_ptr(), &x, 1, &fetch.as_ptr(), &mut output, 1, status.0);
        assert_eq!(status.code(), Code::FailedPrecondition.as_i32());

        TF_DeleteSession(session, status.0);
        status.assert_ok();
        TF_DeleteGraph(graph);
        TFE_DeleteTensorHandle(x);
        TFE_DeleteContext(context);
    }
}
