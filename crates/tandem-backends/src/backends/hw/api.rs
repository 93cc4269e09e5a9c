//! Dynamically bound vendor runtime entry points

use std::ffi::c_void;

use libloading::{Library, Symbol};

use crate::error::{BackendError, Result};

pub(crate) type RtStream = *mut c_void;

pub(crate) const MEMCPY_HOST_TO_DEVICE: u32 = 1;
pub(crate) const MEMCPY_DEVICE_TO_HOST: u32 = 2;
pub(crate) const MEM_HBM_HUGE_FIRST: u32 = 0x0;
pub(crate) const DEV_BINARY_MAGIC_ELF: u32 = 0x4355_4245;
pub(crate) const KERNEL_TYPE_CONTROL: u32 = 5;
pub(crate) const HOST_REGISTER_MAPPED: u32 = 0;

#[repr(C)]
pub(crate) struct DevBinary {
    pub magic: u32,
    pub version: u32,
    pub data: *const c_void,
    pub length: u64,
}

#[repr(C)]
pub(crate) struct ControlArgs {
    pub args: *mut c_void,
    pub host_input_info: *mut c_void,
    pub kernel_offset_info: *mut c_void,
    pub args_size: u32,
    pub host_input_info_num: u16,
    pub kernel_offset_info_num: u16,
    pub so_name_offset: u32,
    pub kernel_name_offset: u32,
    pub no_h2d_copy: bool,
    pub reserved: [u8; 3],
}

/// Vendor runtime and HAL libraries loaded at runtime
pub(crate) struct VendorApi {
    runtime: Library,
    hal: Library,
}

fn check(call: &'static str, code: i32) -> Result<()> {
    if code == 0 {
        Ok(())
    } else {
        Err(BackendError::Driver { call, code })
    }
}

impl VendorApi {
    pub(crate) fn load(runtime_library: &str, hal_library: &str) -> Result<Self> {
        // SAFETY: loading the vendor libraries runs their initializers, which
        // is the documented way to use them.
        unsafe {
            let runtime =
                Library::new(runtime_library).map_err(|e| BackendError::Library(format!("{runtime_library}: {e}")))?;
            let hal = Library::new(hal_library).map_err(|e| BackendError::Library(format!("{hal_library}: {e}")))?;
            Ok(Self { runtime, hal })
        }
    }

    unsafe fn runtime_symbol<T>(&self, name: &'static [u8]) -> Result<Symbol<'_, T>> {
        unsafe {
            self.runtime
                .get(name)
                .map_err(|_| BackendError::Library(format!("missing symbol {}", String::from_utf8_lossy(name))))
        }
    }

    unsafe fn hal_symbol<T>(&self, name: &'static [u8]) -> Result<Symbol<'_, T>> {
        unsafe {
            self.hal
                .get(name)
                .map_err(|_| BackendError::Library(format!("missing symbol {}", String::from_utf8_lossy(name))))
        }
    }

    pub(crate) fn set_device(&self, device_id: i32) -> Result<()> {
        unsafe {
            let f: Symbol<unsafe extern "C" fn(i32) -> i32> = self.runtime_symbol(b"rtSetDevice\0")?;
            check("rtSetDevice", f(device_id))
        }
    }

    pub(crate) fn reset_device(&self, device_id: i32) -> Result<()> {
        unsafe {
            let f: Symbol<unsafe extern "C" fn(i32) -> i32> = self.runtime_symbol(b"rtDeviceReset\0")?;
            check("rtDeviceReset", f(device_id))
        }
    }

    pub(crate) fn stream_create(&self) -> Result<RtStream> {
        unsafe {
            let f: Symbol<unsafe extern "C" fn(*mut RtStream, i32) -> i32> = self.runtime_symbol(b"rtStreamCreate\0")?;
            let mut stream: RtStream = std::ptr::null_mut();
            check("rtStreamCreate", f(&mut stream, 0))?;
            Ok(stream)
        }
    }

    pub(crate) fn stream_destroy(&self, stream: RtStream) -> Result<()> {
        unsafe {
            let f: Symbol<unsafe extern "C" fn(RtStream) -> i32> = self.runtime_symbol(b"rtStreamDestroy\0")?;
            check("rtStreamDestroy", f(stream))
        }
    }

    pub(crate) fn stream_synchronize(&self, stream: RtStream) -> Result<()> {
        unsafe {
            let f: Symbol<unsafe extern "C" fn(RtStream) -> i32> = self.runtime_symbol(b"rtStreamSynchronize\0")?;
            check("rtStreamSynchronize", f(stream))
        }
    }

    pub(crate) fn malloc(&self, bytes: usize) -> Result<u64> {
        unsafe {
            let f: Symbol<unsafe extern "C" fn(*mut *mut c_void, u64, u32, u16) -> i32> =
                self.runtime_symbol(b"rtMalloc\0")?;
            let mut ptr: *mut c_void = std::ptr::null_mut();
            check("rtMalloc", f(&mut ptr, bytes as u64, MEM_HBM_HUGE_FIRST, 0))?;
            if ptr.is_null() {
                return Err(BackendError::Driver { call: "rtMalloc", code: -1 });
            }
            Ok(ptr as u64)
        }
    }

    pub(crate) fn free(&self, addr: u64) -> Result<()> {
        unsafe {
            let f: Symbol<unsafe extern "C" fn(*mut c_void) -> i32> = self.runtime_symbol(b"rtFree\0")?;
            check("rtFree", f(addr as *mut c_void))
        }
    }

    pub(crate) fn memcpy(&self, dst: *mut c_void, src: *const c_void, bytes: usize, kind: u32) -> Result<()> {
        unsafe {
            let f: Symbol<unsafe extern "C" fn(*mut c_void, u64, *const c_void, u64, u32) -> i32> =
                self.runtime_symbol(b"rtMemcpy\0")?;
            check("rtMemcpy", f(dst, bytes as u64, src, bytes as u64, kind))
        }
    }

    pub(crate) fn launch_control(
        &self,
        symbol: &std::ffi::CStr,
        instances: u32,
        args: &mut ControlArgs,
        stream: RtStream,
    ) -> Result<()> {
        unsafe {
            let f: Symbol<
                unsafe extern "C" fn(u32, *const std::ffi::c_char, u32, *const ControlArgs, *mut c_void, RtStream, u32) -> i32,
            > = self.runtime_symbol(b"rtAicpuKernelLaunchExWithArgs\0")?;
            check(
                "rtAicpuKernelLaunchExWithArgs",
                f(KERNEL_TYPE_CONTROL, symbol.as_ptr(), instances, args, std::ptr::null_mut(), stream, 0),
            )
        }
    }

    pub(crate) fn register_binary(&self, image: &[u8]) -> Result<*mut c_void> {
        unsafe {
            let f: Symbol<unsafe extern "C" fn(*const DevBinary, *mut *mut c_void) -> i32> =
                self.runtime_symbol(b"rtDevBinaryRegister\0")?;
            let binary = DevBinary {
                magic: DEV_BINARY_MAGIC_ELF,
                version: 0,
                data: image.as_ptr().cast(),
                length: image.len() as u64,
            };
            let mut handle: *mut c_void = std::ptr::null_mut();
            check("rtDevBinaryRegister", f(&binary, &mut handle))?;
            Ok(handle)
        }
    }

    pub(crate) fn register_function(&self, binary: *mut c_void, stub: *const c_void, symbol: &std::ffi::CStr) -> Result<()> {
        unsafe {
            let f: Symbol<
                unsafe extern "C" fn(*mut c_void, *const c_void, *const std::ffi::c_char, *const c_void, u32) -> i32,
            > = self.runtime_symbol(b"rtFunctionRegister\0")?;
            check(
                "rtFunctionRegister",
                f(binary, stub, symbol.as_ptr(), symbol.as_ptr().cast(), 0),
            )
        }
    }

    pub(crate) fn launch_compute(&self, stub: *const c_void, instances: u32, args: &mut [u64], stream: RtStream) -> Result<()> {
        unsafe {
            let f: Symbol<unsafe extern "C" fn(*const c_void, u32, *mut c_void, u32, *mut c_void, RtStream) -> i32> =
                self.runtime_symbol(b"rtKernelLaunch\0")?;
            check(
                "rtKernelLaunch",
                f(
                    stub,
                    instances,
                    args.as_mut_ptr().cast(),
                    std::mem::size_of_val(args) as u32,
                    std::ptr::null_mut(),
                    stream,
                ),
            )
        }
    }

    pub(crate) fn host_register(&self, host: *mut c_void, bytes: usize, device_id: i32) -> Result<u64> {
        unsafe {
            let f: Symbol<unsafe extern "C" fn(*mut c_void, u64, u32, u32, *mut *mut c_void) -> i32> =
                self.hal_symbol(b"halHostRegister\0")?;
            let mut device_ptr: *mut c_void = std::ptr::null_mut();
            check(
                "halHostRegister",
                f(host, bytes as u64, HOST_REGISTER_MAPPED, device_id as u32, &mut device_ptr),
            )?;
            Ok(device_ptr as u64)
        }
    }

    pub(crate) fn host_unregister(&self, host: *mut c_void, device_id: i32) -> Result<()> {
        unsafe {
            let f: Symbol<unsafe extern "C" fn(*mut c_void, u32) -> i32> = self.hal_symbol(b"halHostUnregister\0")?;
            check("halHostUnregister", f(host, device_id as u32))
        }
    }
}
