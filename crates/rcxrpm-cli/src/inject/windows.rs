//! Windows injection: classic `CreateRemoteThread` + `LoadLibraryA`.

use std::ffi::{c_void, CString};
use std::path::Path;

use rcxrpm_shared::{Error, InjectStep, Result};
use tracing::debug;

use windows::core::s;
use windows::Win32::Foundation::{CloseHandle, HANDLE, WAIT_OBJECT_0};
use windows::Win32::System::Diagnostics::Debug::WriteProcessMemory;
use windows::Win32::System::LibraryLoader::{GetModuleHandleA, GetProcAddress};
use windows::Win32::System::Memory::{
    VirtualAllocEx, VirtualFreeEx, MEM_COMMIT, MEM_RELEASE, MEM_RESERVE, PAGE_READWRITE,
};
use windows::Win32::System::Threading::{
    CreateRemoteThread, GetExitCodeThread, OpenProcess, WaitForSingleObject, PROCESS_ALL_ACCESS,
};

/// Loader call must finish within this many milliseconds.
const LOADER_TIMEOUT_MS: u32 = 10_000;

pub struct RemoteThreadInjector;

impl super::Injector for RemoteThreadInjector {
    fn inject(&self, pid: u32, payload: &Path) -> Result<()> {
        let path = payload
            .to_str()
            .ok_or_else(|| Error::InjectionFailed {
                step: InjectStep::WritePath,
                detail: "payload path is not valid UTF-8".into(),
            })?;
        let path_cstr = CString::new(path).map_err(|_| Error::InjectionFailed {
            step: InjectStep::WritePath,
            detail: "payload path contains a NUL byte".into(),
        })?;

        let process = unsafe { OpenProcess(PROCESS_ALL_ACCESS, false, pid) }.map_err(|e| {
            Error::PermissionDenied(format!(
                "OpenProcess({pid}) failed: {e}. Try running elevated."
            ))
        })?;

        let result = unsafe { inject_into(process, &path_cstr) };
        unsafe {
            let _ = CloseHandle(process);
        }
        result
    }
}

unsafe fn inject_into(process: HANDLE, path: &CString) -> Result<()> {
    let path_bytes = path.as_bytes_with_nul();

    let remote_path = unsafe {
        VirtualAllocEx(
            process,
            None,
            path_bytes.len(),
            MEM_COMMIT | MEM_RESERVE,
            PAGE_READWRITE,
        )
    };
    if remote_path.is_null() {
        return Err(Error::InjectionFailed {
            step: InjectStep::Allocate,
            detail: format!("VirtualAllocEx failed: {}", std::io::Error::last_os_error()),
        });
    }

    // RAII so every early return below releases the remote page.
    struct RemotePage(HANDLE, *mut c_void);
    impl Drop for RemotePage {
        fn drop(&mut self) {
            unsafe {
                let _ = VirtualFreeEx(self.0, self.1, 0, MEM_RELEASE);
            }
        }
    }
    let page = RemotePage(process, remote_path);

    unsafe {
        WriteProcessMemory(
            process,
            remote_path,
            path_bytes.as_ptr() as *const c_void,
            path_bytes.len(),
            None,
        )
    }
    .map_err(|e| Error::InjectionFailed {
        step: InjectStep::WritePath,
        detail: format!("WriteProcessMemory failed: {e}"),
    })?;

    let kernel32 = unsafe { GetModuleHandleA(s!("kernel32.dll")) }.map_err(|e| {
        Error::InjectionFailed {
            step: InjectStep::ResolveLoader,
            detail: format!("GetModuleHandle(kernel32) failed: {e}"),
        }
    })?;
    let load_library = unsafe { GetProcAddress(kernel32, s!("LoadLibraryA")) }.ok_or_else(|| {
        Error::InjectionFailed {
            step: InjectStep::ResolveLoader,
            detail: "GetProcAddress(LoadLibraryA) returned NULL".into(),
        }
    })?;

    let thread = unsafe {
        CreateRemoteThread(
            process,
            None,
            0,
            Some(std::mem::transmute(load_library)),
            Some(remote_path),
            0,
            None,
        )
    }
    .map_err(|e| Error::InjectionFailed {
        step: InjectStep::InvokeLoader,
        detail: format!("CreateRemoteThread failed: {e}"),
    })?;

    let wait = unsafe { WaitForSingleObject(thread, LOADER_TIMEOUT_MS) };
    if wait != WAIT_OBJECT_0 {
        unsafe {
            let _ = CloseHandle(thread);
        }
        return Err(Error::InjectionFailed {
            step: InjectStep::Timeout,
            detail: format!("loader thread did not finish within {LOADER_TIMEOUT_MS} ms"),
        });
    }

    // LoadLibrary's HMODULE comes back as the thread exit code; NULL means
    // the library failed to load.
    let mut exit_code = 0u32;
    let got_code = unsafe { GetExitCodeThread(thread, &mut exit_code) }.is_ok();
    unsafe {
        let _ = CloseHandle(thread);
    }
    drop(page);

    debug!(exit_code, "loader thread finished");
    if !got_code || exit_code == 0 {
        return Err(Error::InjectionFailed {
            step: InjectStep::InvokeLoader,
            detail: format!(
                "LoadLibrary returned NULL in target; ensure the payload exists at {:?}",
                path
            ),
        });
    }
    Ok(())
}
