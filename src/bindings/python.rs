//! Python extension module
//!
//! `initVM` starts the process VM and returns a `JCCEnv`; `getVMEnv` returns
//! it again once started. Foreign exceptions surface as `JavaError`, which
//! keeps the throwable alive for `getJavaException()`. A Python error that
//! travelled through foreign code comes back as itself.

use crate::bridge::{strhash, Bridge, RefDump};
use crate::config::{BridgeConfig, VmOptions};
use crate::errors::{BridgeError, ForeignException, HostError};
use crate::foreign::jvm::JvmLauncher;
use crate::gil::python::PythonLock;
use crate::object::ForeignObject;
use crate::runtime;
use pyo3::exceptions::{PyException, PyRuntimeError, PyTypeError, PyValueError};
use pyo3::prelude::*;

/// Foreign object held from Python
#[pyclass(name = "JavaObject", module = "jbridge")]
pub struct JavaObject {
    obj: ForeignObject,
}

#[pymethods]
impl JavaObject {
    #[pyo3(name = "getClassName")]
    fn class_name(&self) -> PyResult<String> {
        Ok(self.obj.class_name()?)
    }

    fn __str__(&self) -> PyResult<String> {
        Ok(self.obj.to_foreign_string()?)
    }

    fn __hash__(&self) -> PyResult<i32> {
        Ok(self.obj.hash_code()?)
    }

    fn __repr__(&self) -> String {
        format!("<JavaObject {}>", self.obj.key())
    }
}

/// Foreign exception raised into Python
#[pyclass(extends = PyException, name = "JavaError", module = "jbridge")]
pub struct JavaError {
    throwable: Option<Py<JavaObject>>,
    message: String,
}

#[pymethods]
impl JavaError {
    /// The live foreign throwable, `None` if the runtime refused to pin it
    #[pyo3(name = "getJavaException")]
    fn java_exception(&self, py: Python<'_>) -> Option<Py<JavaObject>> {
        self.throwable.as_ref().map(|t| t.clone_ref(py))
    }

    fn __str__(&self) -> String {
        self.message.clone()
    }
}

fn java_error(py: Python<'_>, e: ForeignException) -> PyErr {
    let message = e.to_string();
    let raised = e
        .into_throwable()
        .map(|obj| Py::new(py, JavaObject { obj }))
        .transpose()
        .and_then(|throwable| Py::new(py, JavaError { throwable, message }));
    match raised {
        Ok(error) => PyErr::from_value(error.into_py(py).as_ref(py)),
        Err(err) => err,
    }
}

impl From<BridgeError> for PyErr {
    fn from(err: BridgeError) -> Self {
        match err {
            BridgeError::HostRoundTrip(host) => match host.downcast_ref::<PyErr>() {
                Some(original) => Python::with_gil(|py| original.clone_ref(py)),
                None => PyRuntimeError::new_err(host.to_string()),
            },
            BridgeError::Foreign(e) => Python::with_gil(|py| java_error(py, e)),
            BridgeError::Usage(e) => PyRuntimeError::new_err(e.to_string()),
            BridgeError::Call(e) => PyTypeError::new_err(e.to_string()),
            BridgeError::Config(e) => PyValueError::new_err(e.to_string()),
            launch @ BridgeError::Launch { .. } => PyValueError::new_err(launch.to_string()),
        }
    }
}

/// Wrap a Python error for a trip through foreign code
pub fn host_error(py: Python<'_>, err: PyErr) -> HostError {
    let name = err
        .get_type(py)
        .name()
        .map(str::to_string)
        .unwrap_or_else(|_| "Exception".to_string());
    let traceback = err.traceback(py).and_then(|tb| tb.format().ok());

    let host = HostError::new(err).with_name(name);
    match traceback {
        Some(traceback) => host.with_traceback(traceback),
        None => host,
    }
}

/// The process VM as seen from Python
#[pyclass(name = "JCCEnv", module = "jbridge")]
pub struct JccEnv {
    bridge: Bridge,
}

#[pymethods]
impl JccEnv {
    #[pyo3(name = "attachCurrentThread", signature = (name=None, asDaemon=false))]
    #[allow(non_snake_case)]
    fn attach_current_thread(&self, name: Option<&str>, asDaemon: bool) -> PyResult<i32> {
        Ok(self.bridge.attach_current_thread(name, asDaemon)?)
    }

    #[pyo3(name = "detachCurrentThread")]
    fn detach_current_thread(&self) -> PyResult<i32> {
        Ok(self.bridge.detach_current_thread()?)
    }

    #[pyo3(name = "isCurrentThreadAttached")]
    fn is_current_thread_attached(&self) -> bool {
        self.bridge.is_current_thread_attached()
    }

    /// Python hash of `obj` as eight hex digits
    fn strhash(&self, obj: &PyAny) -> PyResult<String> {
        Ok(strhash(obj.hash()? as i64))
    }

    /// Ledger contents: `{class: count}`, `[(toString, count)]`, or
    /// `[(identity key, count)]`
    #[pyo3(name = "_dumpRefs", signature = (classes=false, values=false))]
    fn dump_refs(&self, py: Python<'_>, classes: bool, values: bool) -> PyResult<PyObject> {
        let dump = self.bridge.dump_refs(classes, values)?;
        Ok(match dump {
            RefDump::ByClass(counts) => counts.into_py(py),
            RefDump::ByValue(values) => values.into_py(py),
            RefDump::ByKey(keys) => keys
                .into_iter()
                .map(|(key, count)| (key.0, count))
                .collect::<Vec<_>>()
                .into_py(py),
        })
    }

    #[pyo3(name = "_addClassPath")]
    fn add_class_path(&self, classpath: &str) -> PyResult<()> {
        Ok(self.bridge.append_class_path(classpath)?)
    }

    fn __repr__(&self) -> String {
        format!("<JCCEnv {}>", self.bridge.description())
    }
}

/// Start the VM, or return the running one
#[pyfunction]
#[pyo3(name = "initVM", signature = (classpath=None, initialheap=None, maxheap=None, maxstack=None, vmargs=None))]
fn init_vm(
    py: Python<'_>,
    classpath: Option<String>,
    initialheap: Option<String>,
    maxheap: Option<String>,
    maxstack: Option<String>,
    vmargs: Option<&str>,
) -> PyResult<JccEnv> {
    let mut requested = VmOptions::new();
    requested.classpath = classpath;
    requested.initial_heap = initialheap;
    requested.max_heap = maxheap;
    requested.max_stack = maxstack;
    if let Some(vmargs) = vmargs {
        requested = requested.with_vm_args(vmargs);
    }

    // A fresh VM starts from jbridge.toml and JBRIDGE_* settings, with the
    // keyword arguments on top; a running one only sees the arguments
    let config = match runtime::current_vm() {
        Some(_) => BridgeConfig::new(requested),
        None => {
            let mut config = BridgeConfig::discover().with_env_overrides();
            overlay(&mut config.vm, requested);
            config
        }
    };

    let launcher = JvmLauncher::new();
    let bridge = py.allow_threads(|| {
        runtime::init_vm_with_lock(&launcher, config, Box::new(PythonLock))
    })?;
    Ok(JccEnv { bridge })
}

fn overlay(base: &mut VmOptions, requested: VmOptions) {
    if requested.classpath.is_some() {
        base.classpath = requested.classpath;
    }
    if requested.initial_heap.is_some() {
        base.initial_heap = requested.initial_heap;
    }
    if requested.max_heap.is_some() {
        base.max_heap = requested.max_heap;
    }
    if requested.max_stack.is_some() {
        base.max_stack = requested.max_stack;
    }
    base.vm_args.extend(requested.vm_args);
}

/// The running VM, or `None`
#[pyfunction]
#[pyo3(name = "getVMEnv")]
fn get_vm_env() -> Option<JccEnv> {
    runtime::current_vm().map(|bridge| JccEnv { bridge })
}

#[pymodule]
fn jbridge(_py: Python, m: &PyModule) -> PyResult<()> {
    m.add_function(wrap_pyfunction!(init_vm, m)?)?;
    m.add_function(wrap_pyfunction!(get_vm_env, m)?)?;
    m.add_class::<JccEnv>()?;
    m.add_class::<JavaObject>()?;
    m.add_class::<JavaError>()?;
    Ok(())
}
