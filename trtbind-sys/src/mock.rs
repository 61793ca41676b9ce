//! In-process stand-in for the native shim.
//!
//! Networks are described in a line-oriented text format instead of ONNX:
//!
//! ```text
//! trtbind-mock-network v1
//! input input float32 1,3,224,224
//! output output float32 1,1000
//! ```
//!
//! The simulated engine sums every `float32`/`int32` input element into `s`
//! and writes `s + j` into element `j` of each `float32` output; other output
//! types are zero-filled. Device memory is plain host memory, streams complete
//! their work at enqueue time.
//!
//! Two devices are simulated. Like CUDA, the current device is per host
//! thread; engines remember the device they were deserialized on and refuse
//! contexts, memory, or launches from another one.

use std::cell::Cell;
use std::collections::HashMap;
use std::ffi::{c_char, c_void, CStr, CString};
use std::sync::{Mutex, OnceLock};

pub const TRTB_SUCCESS: i32 = 0;
pub const TRTB_ERROR_INVALID_ARGUMENT: i32 = 1;
pub const TRTB_ERROR_OUT_OF_MEMORY: i32 = 2;
pub const TRTB_ERROR_RUNTIME_ERROR: i32 = 3;
pub const TRTB_ERROR_CUDA_ERROR: i32 = 4;
pub const TRTB_ERROR_NO_DEVICE: i32 = 5;
pub const TRTB_ERROR_FORMAT: i32 = 6;
pub const TRTB_ERROR_CORRUPTED: i32 = 7;
pub const TRTB_ERROR_UNKNOWN_TENSOR: i32 = 8;
pub const TRTB_ERROR_NOT_READY: i32 = 9;
pub const TRTB_ERROR_UNKNOWN: i32 = 99;

pub const TRTB_SEVERITY_INTERNAL_ERROR: i32 = 0;
pub const TRTB_SEVERITY_ERROR: i32 = 1;
pub const TRTB_SEVERITY_WARNING: i32 = 2;
pub const TRTB_SEVERITY_INFO: i32 = 3;
pub const TRTB_SEVERITY_VERBOSE: i32 = 4;

pub const TRTB_TENSOR_IO_NONE: i32 = 0;
pub const TRTB_TENSOR_IO_INPUT: i32 = 1;
pub const TRTB_TENSOR_IO_OUTPUT: i32 = 2;

pub const TRTB_MAX_DIMS: i32 = 8;

pub type TrtbLoggerCallback = ::std::option::Option<
    unsafe extern "C" fn(user_data: *mut c_void, severity: i32, msg: *const c_char),
>;

pub type TrtbProfilerCallback = ::std::option::Option<
    unsafe extern "C" fn(user_data: *mut c_void, layer_name: *const c_char, ms: f32),
>;

pub type TrtbHostCallback = ::std::option::Option<unsafe extern "C" fn(user_data: *mut c_void)>;

const NETWORK_HEADER: &str = "trtbind-mock-network v1";
const PLAN_HEADER: &str = "trtbind-mock-plan v1";
const MOCK_DEVICE_COUNT: i32 = 2;
const MOCK_LAYER_MS: f32 = 0.05;

thread_local! {
    static ALLOCATION_LIMIT: Cell<usize> = const { Cell::new(0) };
    static CURRENT_DEVICE: Cell<i32> = const { Cell::new(0) };
}

fn current_device() -> i32 {
    CURRENT_DEVICE.with(Cell::get)
}

/// Caps the size of a single device allocation made from the calling thread.
/// `0` removes the cap.
pub fn trtb_mock_set_allocation_limit(bytes: usize) {
    ALLOCATION_LIMIT.with(|limit| limit.set(bytes));
}

#[derive(Debug, Clone)]
struct MockTensor {
    name: CString,
    io: i32,
    dtype: i32,
    dims: Vec<i64>,
}

impl MockTensor {
    fn byte_size(&self) -> usize {
        let elements: usize = self.dims.iter().map(|&d| d.max(0) as usize).product();
        elements * dtype_size(self.dtype)
    }
}

fn dtype_size(dtype: i32) -> usize {
    match dtype {
        0 | 3 => 4,
        1 | 7 => 2,
        8 => 8,
        _ => 1,
    }
}

const DTYPE_NAMES: [(&str, i32); 9] = [
    ("float32", 0),
    ("float16", 1),
    ("int8", 2),
    ("int32", 3),
    ("bool", 4),
    ("uint8", 5),
    ("fp8", 6),
    ("bfloat16", 7),
    ("int64", 8),
];

fn parse_tensors(text: &str, header: &str) -> Result<Vec<MockTensor>, String> {
    let mut lines = text
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'));

    if lines.next() != Some(header) {
        return Err(format!("missing `{}` header", header));
    }

    let mut tensors: Vec<MockTensor> = Vec::new();
    for line in lines {
        let fields: Vec<&str> = line.split_whitespace().collect();
        let &[kind, name, dtype, dims] = fields.as_slice() else {
            return Err(format!("malformed tensor line `{}`", line));
        };
        let io = match kind {
            "input" => TRTB_TENSOR_IO_INPUT,
            "output" => TRTB_TENSOR_IO_OUTPUT,
            other => return Err(format!("unknown tensor kind `{}`", other)),
        };
        let dtype = DTYPE_NAMES
            .iter()
            .find(|(n, _)| *n == dtype)
            .map(|(_, code)| *code)
            .ok_or_else(|| format!("unknown data type `{}`", dtype))?;
        let dims = dims
            .split(',')
            .map(|d| d.parse::<i64>().map_err(|_| format!("bad dimension `{}`", d)))
            .collect::<Result<Vec<_>, _>>()?;
        if dims.len() > TRTB_MAX_DIMS as usize {
            return Err(format!("tensor `{}` has more than {} dims", name, TRTB_MAX_DIMS));
        }
        if tensors.iter().any(|t| t.name.as_bytes() == name.as_bytes()) {
            return Err(format!("duplicate tensor `{}`", name));
        }
        let name = CString::new(name).map_err(|_| "tensor name contains NUL".to_string())?;
        tensors.push(MockTensor {
            name,
            io,
            dtype,
            dims,
        });
    }
    Ok(tensors)
}

fn render_tensors(header: &str, tensors: &[MockTensor]) -> Vec<u8> {
    let mut text = format!("{}\n", header);
    for tensor in tensors {
        let kind = if tensor.io == TRTB_TENSOR_IO_INPUT {
            "input"
        } else {
            "output"
        };
        let dtype = DTYPE_NAMES
            .iter()
            .find(|(_, code)| *code == tensor.dtype)
            .map(|(n, _)| *n)
            .unwrap_or("uint8");
        let dims: Vec<String> = tensor.dims.iter().map(i64::to_string).collect();
        text.push_str(&format!(
            "{} {} {} {}\n",
            kind,
            tensor.name.to_string_lossy(),
            dtype,
            dims.join(",")
        ));
    }
    text.into_bytes()
}

unsafe fn fail(code: i32, error_msg: *mut c_char, error_msg_len: usize, msg: &str) -> i32 {
    if !error_msg.is_null() && error_msg_len > 0 {
        let n = msg.len().min(error_msg_len - 1);
        std::ptr::copy_nonoverlapping(msg.as_ptr() as *const c_char, error_msg, n);
        *error_msg.add(n) = 0;
    }
    code
}

#[derive(Clone, Copy)]
struct Allocation {
    len: usize,
    device: i32,
}

// Base address -> every live buffer handed out by the mock.
fn allocations() -> &'static Mutex<HashMap<usize, Allocation>> {
    static ALLOCATIONS: OnceLock<Mutex<HashMap<usize, Allocation>>> = OnceLock::new();
    ALLOCATIONS.get_or_init(|| Mutex::new(HashMap::new()))
}

fn alloc_bytes(mut bytes: Vec<u8>) -> *mut c_void {
    let len = bytes.len().max(1);
    bytes.resize(len, 0);
    let ptr = Box::into_raw(bytes.into_boxed_slice()) as *mut u8;
    allocations()
        .lock()
        .unwrap_or_else(|e| e.into_inner())
        .insert(
            ptr as usize,
            Allocation {
                len,
                device: current_device(),
            },
        );
    ptr as *mut c_void
}

fn release(ptr: *mut c_void) -> bool {
    let len = allocations()
        .lock()
        .unwrap_or_else(|e| e.into_inner())
        .remove(&(ptr as usize))
        .map(|a| a.len);
    match len {
        Some(len) => {
            unsafe {
                drop(Box::from_raw(std::ptr::slice_from_raw_parts_mut(
                    ptr as *mut u8,
                    len,
                )));
            }
            true
        }
        None => false,
    }
}

fn region(ptr: *const c_void, size: usize) -> Option<Allocation> {
    allocations()
        .lock()
        .unwrap_or_else(|e| e.into_inner())
        .get(&(ptr as usize))
        .copied()
        .filter(|a| a.len >= size)
}

fn region_valid(ptr: *const c_void, size: usize) -> bool {
    region(ptr, size).is_some()
}

unsafe fn check_device(
    engine: &TrtbCudaEngine,
    error_msg: *mut c_char,
    error_msg_len: usize,
) -> Result<(), i32> {
    let current = current_device();
    if current == engine.device {
        return Ok(());
    }
    let msg = format!(
        "cudaErrorInvalidDevice: engine lives on device {}, current device is {}",
        engine.device, current
    );
    Err(fail(TRTB_ERROR_CUDA_ERROR, error_msg, error_msg_len, &msg))
}

pub struct TrtbLogger {
    callback: TrtbLoggerCallback,
    user_data: *mut c_void,
}

unsafe fn log(logger: *const TrtbLogger, severity: i32, msg: &str) {
    if logger.is_null() {
        return;
    }
    let logger = &*logger;
    if let (Some(callback), Ok(msg)) = (logger.callback, CString::new(msg)) {
        callback(logger.user_data, severity, msg.as_ptr());
    }
}

pub struct TrtbBuilder {
    logger: *mut TrtbLogger,
}

pub struct TrtbBuilderConfig {
    workspace: usize,
}

pub struct TrtbNetworkDefinition {
    tensors: Vec<MockTensor>,
}

pub struct TrtbOnnxParser {
    network: *mut TrtbNetworkDefinition,
    logger: *mut TrtbLogger,
}

pub struct TrtbRuntime {
    logger: *mut TrtbLogger,
}

pub struct TrtbCudaEngine {
    tensors: Vec<MockTensor>,
    device: i32,
}

impl TrtbCudaEngine {
    unsafe fn find(&self, name: *const c_char) -> Option<&MockTensor> {
        if name.is_null() {
            return None;
        }
        let name = CStr::from_ptr(name);
        self.tensors.iter().find(|t| t.name.as_c_str() == name)
    }
}

pub struct TrtbExecutionContext {
    engine: *const TrtbCudaEngine,
    addresses: HashMap<CString, usize>,
    profiler: TrtbProfilerCallback,
    profiler_data: *mut c_void,
}

struct MockStream {
    _id: u64,
}

pub unsafe extern "C" fn trtb_logger_create(
    callback: TrtbLoggerCallback,
    user_data: *mut c_void,
    out_logger: *mut *mut TrtbLogger,
    error_msg: *mut c_char,
    error_msg_len: usize,
) -> i32 {
    if out_logger.is_null() {
        return fail(TRTB_ERROR_INVALID_ARGUMENT, error_msg, error_msg_len, "out_logger is null");
    }
    *out_logger = Box::into_raw(Box::new(TrtbLogger {
        callback,
        user_data,
    }));
    TRTB_SUCCESS
}

pub unsafe extern "C" fn trtb_logger_destroy(logger: *mut TrtbLogger) {
    if !logger.is_null() {
        drop(Box::from_raw(logger));
    }
}

pub unsafe extern "C" fn trtb_builder_create(
    logger: *mut TrtbLogger,
    out_builder: *mut *mut TrtbBuilder,
    error_msg: *mut c_char,
    error_msg_len: usize,
) -> i32 {
    if logger.is_null() || out_builder.is_null() {
        return fail(TRTB_ERROR_INVALID_ARGUMENT, error_msg, error_msg_len, "null argument");
    }
    *out_builder = Box::into_raw(Box::new(TrtbBuilder { logger }));
    TRTB_SUCCESS
}

pub unsafe extern "C" fn trtb_builder_destroy(builder: *mut TrtbBuilder) {
    if !builder.is_null() {
        drop(Box::from_raw(builder));
    }
}

pub unsafe extern "C" fn trtb_builder_create_network(
    builder: *mut TrtbBuilder,
    _flags: u32,
    out_network: *mut *mut TrtbNetworkDefinition,
    error_msg: *mut c_char,
    error_msg_len: usize,
) -> i32 {
    if builder.is_null() || out_network.is_null() {
        return fail(TRTB_ERROR_INVALID_ARGUMENT, error_msg, error_msg_len, "null argument");
    }
    *out_network = Box::into_raw(Box::new(TrtbNetworkDefinition {
        tensors: Vec::new(),
    }));
    TRTB_SUCCESS
}

pub unsafe extern "C" fn trtb_builder_create_builder_config(
    builder: *mut TrtbBuilder,
    out_config: *mut *mut TrtbBuilderConfig,
    error_msg: *mut c_char,
    error_msg_len: usize,
) -> i32 {
    if builder.is_null() || out_config.is_null() {
        return fail(TRTB_ERROR_INVALID_ARGUMENT, error_msg, error_msg_len, "null argument");
    }
    *out_config = Box::into_raw(Box::new(TrtbBuilderConfig { workspace: 0 }));
    TRTB_SUCCESS
}

pub unsafe extern "C" fn trtb_builder_build_serialized_network(
    builder: *mut TrtbBuilder,
    network: *mut TrtbNetworkDefinition,
    config: *mut TrtbBuilderConfig,
    out_data: *mut *mut c_void,
    out_size: *mut usize,
    error_msg: *mut c_char,
    error_msg_len: usize,
) -> i32 {
    if builder.is_null()
        || network.is_null()
        || config.is_null()
        || out_data.is_null()
        || out_size.is_null()
    {
        return fail(TRTB_ERROR_INVALID_ARGUMENT, error_msg, error_msg_len, "null argument");
    }
    let network = &*network;
    if !network.tensors.iter().any(|t| t.io == TRTB_TENSOR_IO_OUTPUT) {
        return fail(
            TRTB_ERROR_RUNTIME_ERROR,
            error_msg,
            error_msg_len,
            "network must have at least one output",
        );
    }
    log(
        (*builder).logger,
        TRTB_SEVERITY_INFO,
        &format!(
            "building engine for {} I/O tensors (workspace limit {} bytes)",
            network.tensors.len(),
            (*config).workspace
        ),
    );
    let plan = render_tensors(PLAN_HEADER, &network.tensors);
    *out_size = plan.len();
    *out_data = alloc_bytes(plan);
    TRTB_SUCCESS
}

pub unsafe extern "C" fn trtb_builder_config_destroy(config: *mut TrtbBuilderConfig) {
    if !config.is_null() {
        drop(Box::from_raw(config));
    }
}

pub unsafe extern "C" fn trtb_builder_config_set_memory_pool_limit(
    config: *mut TrtbBuilderConfig,
    pool_type: i32,
    pool_size: usize,
    error_msg: *mut c_char,
    error_msg_len: usize,
) -> i32 {
    if config.is_null() {
        return fail(TRTB_ERROR_INVALID_ARGUMENT, error_msg, error_msg_len, "config is null");
    }
    if !(0..=3).contains(&pool_type) {
        return fail(
            TRTB_ERROR_INVALID_ARGUMENT,
            error_msg,
            error_msg_len,
            "unknown memory pool type",
        );
    }
    if pool_type == 0 {
        (*config).workspace = pool_size;
    }
    TRTB_SUCCESS
}

pub unsafe extern "C" fn trtb_network_destroy(network: *mut TrtbNetworkDefinition) {
    if !network.is_null() {
        drop(Box::from_raw(network));
    }
}

pub unsafe extern "C" fn trtb_onnx_parser_create(
    network: *mut TrtbNetworkDefinition,
    logger: *mut TrtbLogger,
    out_parser: *mut *mut TrtbOnnxParser,
    error_msg: *mut c_char,
    error_msg_len: usize,
) -> i32 {
    if network.is_null() || logger.is_null() || out_parser.is_null() {
        return fail(TRTB_ERROR_INVALID_ARGUMENT, error_msg, error_msg_len, "null argument");
    }
    *out_parser = Box::into_raw(Box::new(TrtbOnnxParser { network, logger }));
    TRTB_SUCCESS
}

pub unsafe extern "C" fn trtb_onnx_parser_parse(
    parser: *mut TrtbOnnxParser,
    data: *const c_void,
    size: usize,
    error_msg: *mut c_char,
    error_msg_len: usize,
) -> i32 {
    if parser.is_null() || data.is_null() {
        return fail(TRTB_ERROR_INVALID_ARGUMENT, error_msg, error_msg_len, "null argument");
    }
    let bytes = std::slice::from_raw_parts(data as *const u8, size);
    let parsed = std::str::from_utf8(bytes)
        .map_err(|_| "not a text network description".to_string())
        .and_then(|text| parse_tensors(text, NETWORK_HEADER));
    match parsed {
        Ok(tensors) => {
            log(
                (*parser).logger,
                TRTB_SEVERITY_VERBOSE,
                &format!("parsed network with {} I/O tensors", tensors.len()),
            );
            (*(*parser).network).tensors = tensors;
            TRTB_SUCCESS
        }
        Err(e) => fail(
            TRTB_ERROR_FORMAT,
            error_msg,
            error_msg_len,
            &format!("failed to parse network description: {}", e),
        ),
    }
}

pub unsafe extern "C" fn trtb_onnx_parser_destroy(parser: *mut TrtbOnnxParser) {
    if !parser.is_null() {
        drop(Box::from_raw(parser));
    }
}

pub unsafe extern "C" fn trtb_runtime_create(
    logger: *mut TrtbLogger,
    out_runtime: *mut *mut TrtbRuntime,
    error_msg: *mut c_char,
    error_msg_len: usize,
) -> i32 {
    if logger.is_null() || out_runtime.is_null() {
        return fail(TRTB_ERROR_INVALID_ARGUMENT, error_msg, error_msg_len, "null argument");
    }
    *out_runtime = Box::into_raw(Box::new(TrtbRuntime { logger }));
    TRTB_SUCCESS
}

pub unsafe extern "C" fn trtb_runtime_destroy(runtime: *mut TrtbRuntime) {
    if !runtime.is_null() {
        drop(Box::from_raw(runtime));
    }
}

pub unsafe extern "C" fn trtb_runtime_deserialize_cuda_engine(
    runtime: *mut TrtbRuntime,
    data: *const c_void,
    size: usize,
    out_engine: *mut *mut TrtbCudaEngine,
    error_msg: *mut c_char,
    error_msg_len: usize,
) -> i32 {
    if runtime.is_null() || data.is_null() || out_engine.is_null() {
        return fail(TRTB_ERROR_INVALID_ARGUMENT, error_msg, error_msg_len, "null argument");
    }
    let bytes = std::slice::from_raw_parts(data as *const u8, size);
    let parsed = std::str::from_utf8(bytes)
        .map_err(|_| "plan is not valid".to_string())
        .and_then(|text| parse_tensors(text, PLAN_HEADER));
    match parsed {
        Ok(tensors) => {
            log(
                (*runtime).logger,
                TRTB_SEVERITY_INFO,
                &format!("loaded engine with {} I/O tensors", tensors.len()),
            );
            *out_engine = Box::into_raw(Box::new(TrtbCudaEngine {
                tensors,
                device: current_device(),
            }));
            TRTB_SUCCESS
        }
        Err(e) => {
            log((*runtime).logger, TRTB_SEVERITY_ERROR, &e);
            fail(
                TRTB_ERROR_CORRUPTED,
                error_msg,
                error_msg_len,
                &format!("deserializeCudaEngine rejected the plan: {}", e),
            )
        }
    }
}

pub unsafe extern "C" fn trtb_cuda_engine_destroy(engine: *mut TrtbCudaEngine) {
    if !engine.is_null() {
        drop(Box::from_raw(engine));
    }
}

pub unsafe extern "C" fn trtb_cuda_engine_get_nb_io_tensors(
    engine: *mut TrtbCudaEngine,
    out_count: *mut i32,
) -> i32 {
    if engine.is_null() || out_count.is_null() {
        return TRTB_ERROR_INVALID_ARGUMENT;
    }
    *out_count = (*engine).tensors.len() as i32;
    TRTB_SUCCESS
}

pub unsafe extern "C" fn trtb_cuda_engine_get_tensor_name(
    engine: *mut TrtbCudaEngine,
    index: i32,
    out_name: *mut *const c_char,
    error_msg: *mut c_char,
    error_msg_len: usize,
) -> i32 {
    if engine.is_null() || out_name.is_null() {
        return fail(TRTB_ERROR_INVALID_ARGUMENT, error_msg, error_msg_len, "null argument");
    }
    let tensors = &(*engine).tensors;
    match usize::try_from(index).ok().and_then(|i| tensors.get(i)) {
        Some(tensor) => {
            *out_name = tensor.name.as_ptr();
            TRTB_SUCCESS
        }
        None => fail(
            TRTB_ERROR_INVALID_ARGUMENT,
            error_msg,
            error_msg_len,
            "tensor index out of range",
        ),
    }
}

pub unsafe extern "C" fn trtb_cuda_engine_get_tensor_shape(
    engine: *mut TrtbCudaEngine,
    name: *const c_char,
    out_dims: *mut i64,
    max_dims: i32,
    out_nb_dims: *mut i32,
    error_msg: *mut c_char,
    error_msg_len: usize,
) -> i32 {
    if engine.is_null() || name.is_null() || out_dims.is_null() || out_nb_dims.is_null() {
        return fail(TRTB_ERROR_INVALID_ARGUMENT, error_msg, error_msg_len, "null argument");
    }
    let Some(tensor) = (*engine).find(name) else {
        return fail(TRTB_ERROR_UNKNOWN_TENSOR, error_msg, error_msg_len, "no such tensor");
    };
    if tensor.dims.len() > max_dims.max(0) as usize {
        return fail(
            TRTB_ERROR_INVALID_ARGUMENT,
            error_msg,
            error_msg_len,
            "too many dimensions",
        );
    }
    for (i, &d) in tensor.dims.iter().enumerate() {
        *out_dims.add(i) = d;
    }
    *out_nb_dims = tensor.dims.len() as i32;
    TRTB_SUCCESS
}

pub unsafe extern "C" fn trtb_cuda_engine_get_tensor_dtype(
    engine: *mut TrtbCudaEngine,
    name: *const c_char,
    out_dtype: *mut i32,
    error_msg: *mut c_char,
    error_msg_len: usize,
) -> i32 {
    if engine.is_null() || out_dtype.is_null() {
        return fail(TRTB_ERROR_INVALID_ARGUMENT, error_msg, error_msg_len, "null argument");
    }
    match (*engine).find(name) {
        Some(tensor) => {
            *out_dtype = tensor.dtype;
            TRTB_SUCCESS
        }
        None => fail(TRTB_ERROR_UNKNOWN_TENSOR, error_msg, error_msg_len, "no such tensor"),
    }
}

pub unsafe extern "C" fn trtb_cuda_engine_get_tensor_io_mode(
    engine: *mut TrtbCudaEngine,
    name: *const c_char,
    out_mode: *mut i32,
    error_msg: *mut c_char,
    error_msg_len: usize,
) -> i32 {
    if engine.is_null() || out_mode.is_null() {
        return fail(TRTB_ERROR_INVALID_ARGUMENT, error_msg, error_msg_len, "null argument");
    }
    *out_mode = (*engine)
        .find(name)
        .map(|t| t.io)
        .unwrap_or(TRTB_TENSOR_IO_NONE);
    TRTB_SUCCESS
}

pub unsafe extern "C" fn trtb_cuda_engine_serialize(
    engine: *mut TrtbCudaEngine,
    out_data: *mut *mut c_void,
    out_size: *mut usize,
    error_msg: *mut c_char,
    error_msg_len: usize,
) -> i32 {
    if engine.is_null() || out_data.is_null() || out_size.is_null() {
        return fail(TRTB_ERROR_INVALID_ARGUMENT, error_msg, error_msg_len, "null argument");
    }
    let plan = render_tensors(PLAN_HEADER, &(*engine).tensors);
    *out_size = plan.len();
    *out_data = alloc_bytes(plan);
    TRTB_SUCCESS
}

pub unsafe extern "C" fn trtb_cuda_engine_create_execution_context(
    engine: *mut TrtbCudaEngine,
    out_context: *mut *mut TrtbExecutionContext,
    error_msg: *mut c_char,
    error_msg_len: usize,
) -> i32 {
    if engine.is_null() || out_context.is_null() {
        return fail(TRTB_ERROR_INVALID_ARGUMENT, error_msg, error_msg_len, "null argument");
    }
    if let Err(code) = check_device(&*engine, error_msg, error_msg_len) {
        return code;
    }
    *out_context = Box::into_raw(Box::new(TrtbExecutionContext {
        engine,
        addresses: HashMap::new(),
        profiler: None,
        profiler_data: std::ptr::null_mut(),
    }));
    TRTB_SUCCESS
}

pub unsafe extern "C" fn trtb_execution_context_destroy(context: *mut TrtbExecutionContext) {
    if !context.is_null() {
        drop(Box::from_raw(context));
    }
}

pub unsafe extern "C" fn trtb_execution_context_set_tensor_address(
    context: *mut TrtbExecutionContext,
    tensor_name: *const c_char,
    data: *mut c_void,
    error_msg: *mut c_char,
    error_msg_len: usize,
) -> i32 {
    if context.is_null() || tensor_name.is_null() {
        return fail(TRTB_ERROR_INVALID_ARGUMENT, error_msg, error_msg_len, "null argument");
    }
    let context = &mut *context;
    let Some(tensor) = (*context.engine).find(tensor_name) else {
        return fail(
            TRTB_ERROR_UNKNOWN_TENSOR,
            error_msg,
            error_msg_len,
            "setTensorAddress: no such tensor",
        );
    };
    context.addresses.insert(tensor.name.clone(), data as usize);
    TRTB_SUCCESS
}

pub unsafe extern "C" fn trtb_execution_context_set_profiler(
    context: *mut TrtbExecutionContext,
    callback: TrtbProfilerCallback,
    user_data: *mut c_void,
    error_msg: *mut c_char,
    error_msg_len: usize,
) -> i32 {
    if context.is_null() {
        return fail(TRTB_ERROR_INVALID_ARGUMENT, error_msg, error_msg_len, "context is null");
    }
    (*context).profiler = callback;
    (*context).profiler_data = if callback.is_some() {
        user_data
    } else {
        std::ptr::null_mut()
    };
    TRTB_SUCCESS
}

pub unsafe extern "C" fn trtb_execution_context_enqueue_v3(
    context: *mut TrtbExecutionContext,
    _cuda_stream: *mut c_void,
    error_msg: *mut c_char,
    error_msg_len: usize,
) -> i32 {
    if context.is_null() {
        return fail(TRTB_ERROR_INVALID_ARGUMENT, error_msg, error_msg_len, "context is null");
    }
    let context = &*context;
    let engine = &*context.engine;
    if let Err(code) = check_device(engine, error_msg, error_msg_len) {
        return code;
    }

    let mut sum = 0f64;
    for tensor in engine.tensors.iter() {
        let Some(&addr) = context.addresses.get(&tensor.name) else {
            let msg = format!("address of tensor `{}` is not set", tensor.name.to_string_lossy());
            return fail(TRTB_ERROR_INVALID_ARGUMENT, error_msg, error_msg_len, &msg);
        };
        match region(addr as *const c_void, tensor.byte_size()) {
            Some(a) if a.device == engine.device => {}
            Some(a) => {
                let msg = format!(
                    "tensor `{}` is bound to memory on device {}, engine is on device {}",
                    tensor.name.to_string_lossy(),
                    a.device,
                    engine.device
                );
                return fail(TRTB_ERROR_CUDA_ERROR, error_msg, error_msg_len, &msg);
            }
            None => {
                let msg = format!("tensor `{}` is bound to invalid memory", tensor.name.to_string_lossy());
                return fail(TRTB_ERROR_CUDA_ERROR, error_msg, error_msg_len, &msg);
            }
        }
        if tensor.io != TRTB_TENSOR_IO_INPUT {
            continue;
        }
        let bytes = std::slice::from_raw_parts(addr as *const u8, tensor.byte_size());
        let mut word = [0u8; 4];
        match tensor.dtype {
            0 => {
                for chunk in bytes.chunks_exact(4) {
                    word.copy_from_slice(chunk);
                    sum += f32::from_le_bytes(word) as f64;
                }
            }
            3 => {
                for chunk in bytes.chunks_exact(4) {
                    word.copy_from_slice(chunk);
                    sum += i32::from_le_bytes(word) as f64;
                }
            }
            _ => {}
        }
    }

    for tensor in engine.tensors.iter().filter(|t| t.io == TRTB_TENSOR_IO_OUTPUT) {
        let addr = context.addresses[&tensor.name];
        let out = std::slice::from_raw_parts_mut(addr as *mut u8, tensor.byte_size());
        if tensor.dtype == 0 {
            for (j, chunk) in out.chunks_exact_mut(4).enumerate() {
                chunk.copy_from_slice(&((sum + j as f64) as f32).to_le_bytes());
            }
        } else {
            out.fill(0);
        }

        if let Some(profiler) = context.profiler {
            let layer = format!("mock_reduce_{}", tensor.name.to_string_lossy());
            if let Ok(layer) = CString::new(layer) {
                profiler(context.profiler_data, layer.as_ptr(), MOCK_LAYER_MS);
            }
        }
    }
    TRTB_SUCCESS
}

pub unsafe extern "C" fn trtb_free_buffer(buffer: *mut c_void) {
    if !buffer.is_null() {
        release(buffer);
    }
}

pub unsafe extern "C" fn trtb_cuda_get_device_count(
    out_count: *mut i32,
    error_msg: *mut c_char,
    error_msg_len: usize,
) -> i32 {
    if out_count.is_null() {
        return fail(TRTB_ERROR_INVALID_ARGUMENT, error_msg, error_msg_len, "out_count is null");
    }
    *out_count = MOCK_DEVICE_COUNT;
    TRTB_SUCCESS
}

pub unsafe extern "C" fn trtb_cuda_set_device(
    device: i32,
    error_msg: *mut c_char,
    error_msg_len: usize,
) -> i32 {
    if !(0..MOCK_DEVICE_COUNT).contains(&device) {
        return fail(
            TRTB_ERROR_CUDA_ERROR,
            error_msg,
            error_msg_len,
            "cudaErrorInvalidDevice: invalid device ordinal",
        );
    }
    CURRENT_DEVICE.with(|current| current.set(device));
    TRTB_SUCCESS
}

pub unsafe extern "C" fn trtb_cuda_malloc(
    ptr: *mut *mut c_void,
    size: usize,
    error_msg: *mut c_char,
    error_msg_len: usize,
) -> i32 {
    if ptr.is_null() {
        return fail(TRTB_ERROR_INVALID_ARGUMENT, error_msg, error_msg_len, "ptr is null");
    }
    let limit = ALLOCATION_LIMIT.with(Cell::get);
    if limit != 0 && size > limit {
        return fail(
            TRTB_ERROR_OUT_OF_MEMORY,
            error_msg,
            error_msg_len,
            "cudaErrorMemoryAllocation: out of memory",
        );
    }
    *ptr = alloc_bytes(vec![0u8; size]);
    TRTB_SUCCESS
}

pub unsafe extern "C" fn trtb_cuda_free(
    ptr: *mut c_void,
    error_msg: *mut c_char,
    error_msg_len: usize,
) -> i32 {
    if ptr.is_null() || release(ptr) {
        return TRTB_SUCCESS;
    }
    fail(
        TRTB_ERROR_CUDA_ERROR,
        error_msg,
        error_msg_len,
        "cudaErrorInvalidValue: invalid device pointer",
    )
}

unsafe fn copy(
    dst: *mut c_void,
    src: *const c_void,
    size: usize,
    device: *const c_void,
    error_msg: *mut c_char,
    error_msg_len: usize,
) -> i32 {
    if dst.is_null() || src.is_null() {
        return fail(TRTB_ERROR_INVALID_ARGUMENT, error_msg, error_msg_len, "null pointer");
    }
    if !region_valid(device, size) {
        return fail(
            TRTB_ERROR_CUDA_ERROR,
            error_msg,
            error_msg_len,
            "cudaErrorInvalidValue: invalid device pointer",
        );
    }
    std::ptr::copy_nonoverlapping(src as *const u8, dst as *mut u8, size);
    TRTB_SUCCESS
}

pub unsafe extern "C" fn trtb_cuda_memcpy_host_to_device(
    dst: *mut c_void,
    src: *const c_void,
    size: usize,
    error_msg: *mut c_char,
    error_msg_len: usize,
) -> i32 {
    copy(dst, src, size, dst, error_msg, error_msg_len)
}

pub unsafe extern "C" fn trtb_cuda_memcpy_device_to_host(
    dst: *mut c_void,
    src: *const c_void,
    size: usize,
    error_msg: *mut c_char,
    error_msg_len: usize,
) -> i32 {
    copy(dst, src, size, src, error_msg, error_msg_len)
}

pub unsafe extern "C" fn trtb_cuda_memcpy_host_to_device_async(
    dst: *mut c_void,
    src: *const c_void,
    size: usize,
    _stream: *mut c_void,
    error_msg: *mut c_char,
    error_msg_len: usize,
) -> i32 {
    copy(dst, src, size, dst, error_msg, error_msg_len)
}

pub unsafe extern "C" fn trtb_cuda_memcpy_device_to_host_async(
    dst: *mut c_void,
    src: *const c_void,
    size: usize,
    _stream: *mut c_void,
    error_msg: *mut c_char,
    error_msg_len: usize,
) -> i32 {
    copy(dst, src, size, src, error_msg, error_msg_len)
}

pub unsafe extern "C" fn trtb_cuda_synchronize(_error_msg: *mut c_char, _error_msg_len: usize) -> i32 {
    TRTB_SUCCESS
}

pub unsafe extern "C" fn trtb_cuda_stream_create(
    out_stream: *mut *mut c_void,
    error_msg: *mut c_char,
    error_msg_len: usize,
) -> i32 {
    if out_stream.is_null() {
        return fail(TRTB_ERROR_INVALID_ARGUMENT, error_msg, error_msg_len, "out_stream is null");
    }
    *out_stream = Box::into_raw(Box::new(MockStream { _id: 0 })) as *mut c_void;
    TRTB_SUCCESS
}

pub unsafe extern "C" fn trtb_cuda_stream_destroy(
    stream: *mut c_void,
    _error_msg: *mut c_char,
    _error_msg_len: usize,
) -> i32 {
    if !stream.is_null() {
        drop(Box::from_raw(stream as *mut MockStream));
    }
    TRTB_SUCCESS
}

pub unsafe extern "C" fn trtb_cuda_stream_synchronize(
    _stream: *mut c_void,
    _error_msg: *mut c_char,
    _error_msg_len: usize,
) -> i32 {
    TRTB_SUCCESS
}

pub unsafe extern "C" fn trtb_cuda_stream_query(
    _stream: *mut c_void,
    _error_msg: *mut c_char,
    _error_msg_len: usize,
) -> i32 {
    TRTB_SUCCESS
}

pub unsafe extern "C" fn trtb_cuda_launch_host_func(
    _stream: *mut c_void,
    callback: TrtbHostCallback,
    user_data: *mut c_void,
    error_msg: *mut c_char,
    error_msg_len: usize,
) -> i32 {
    match callback {
        Some(callback) => {
            callback(user_data);
            TRTB_SUCCESS
        }
        None => fail(TRTB_ERROR_INVALID_ARGUMENT, error_msg, error_msg_len, "callback is null"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_network_description() {
        let text = "trtbind-mock-network v1\n# comment\ninput x float32 1,4\noutput y int32 2\n";
        let tensors = parse_tensors(text, NETWORK_HEADER).unwrap();
        assert_eq!(tensors.len(), 2);
        assert_eq!(tensors[0].io, TRTB_TENSOR_IO_INPUT);
        assert_eq!(tensors[0].byte_size(), 16);
        assert_eq!(tensors[1].dtype, 3);
    }

    #[test]
    fn test_parse_rejects_duplicates_and_missing_header() {
        assert!(parse_tensors("input x float32 1", NETWORK_HEADER).is_err());
        let dup = "trtbind-mock-network v1\ninput x float32 1\noutput x float32 1\n";
        assert!(parse_tensors(dup, NETWORK_HEADER).is_err());
    }

    #[test]
    fn test_allocation_limit_is_per_thread() {
        trtb_mock_set_allocation_limit(8);
        let mut ptr = std::ptr::null_mut();
        let rc = unsafe { trtb_cuda_malloc(&mut ptr, 16, std::ptr::null_mut(), 0) };
        assert_eq!(rc, TRTB_ERROR_OUT_OF_MEMORY);

        std::thread::spawn(|| {
            let mut ptr = std::ptr::null_mut();
            let rc = unsafe { trtb_cuda_malloc(&mut ptr, 16, std::ptr::null_mut(), 0) };
            assert_eq!(rc, TRTB_SUCCESS);
            assert_eq!(unsafe { trtb_cuda_free(ptr, std::ptr::null_mut(), 0) }, TRTB_SUCCESS);
        })
        .join()
        .unwrap();

        trtb_mock_set_allocation_limit(0);
    }

    #[test]
    fn test_current_device_is_per_thread() {
        assert_eq!(unsafe { trtb_cuda_set_device(1, std::ptr::null_mut(), 0) }, TRTB_SUCCESS);
        assert_eq!(current_device(), 1);
        std::thread::spawn(|| assert_eq!(current_device(), 0))
            .join()
            .unwrap();

        let rc = unsafe { trtb_cuda_set_device(MOCK_DEVICE_COUNT, std::ptr::null_mut(), 0) };
        assert_eq!(rc, TRTB_ERROR_CUDA_ERROR);
        assert_eq!(current_device(), 1);
    }
}
