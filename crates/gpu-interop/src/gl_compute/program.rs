//! Compute program compilation and GL error checks.

use std::ffi::CString;

use gl::types::{GLchar, GLenum, GLint, GLuint};

use crate::error::{InteropError, Result};

/// Drop errors left behind by the host so they are not attributed to us.
pub(crate) fn clear_gl_errors() {
    unsafe { while gl::GetError() != gl::NO_ERROR {} }
}

/// Fail with the pending GL error codes, if any.
#[track_caller]
pub(crate) fn check_gl(call: &'static str) -> Result<()> {
    let mut codes: Vec<GLenum> = Vec::new();
    loop {
        let code = unsafe { gl::GetError() };
        if code == gl::NO_ERROR || codes.len() == 8 {
            break;
        }
        codes.push(code);
    }
    if codes.is_empty() {
        return Ok(());
    }
    let listed: Vec<String> = codes.iter().map(|c| format!("0x{c:04X}")).collect();
    Err(InteropError::call(
        call,
        format!("glGetError: {}", listed.join(", ")),
    ))
}

pub(crate) fn is_context_current() -> bool {
    unsafe { !gl::GetString(gl::VERSION).is_null() }
}

/// Compile and link one compute shader.
pub(crate) fn compile_compute(name: &str, source: &str) -> Result<GLuint> {
    let source = CString::new(source)
        .map_err(|_| InteropError::call("glShaderSource", format!("{name}: source contains NUL")))?;

    unsafe {
        let shader = gl::CreateShader(gl::COMPUTE_SHADER);
        check_gl("glCreateShader")?;
        gl::ShaderSource(shader, 1, &source.as_ptr(), std::ptr::null());
        gl::CompileShader(shader);

        let mut status: GLint = 0;
        gl::GetShaderiv(shader, gl::COMPILE_STATUS, &mut status);
        if status == 0 {
            let log = shader_log(shader);
            gl::DeleteShader(shader);
            return Err(InteropError::call(
                "glCompileShader",
                format!("{name}: {log}"),
            ));
        }

        let program = gl::CreateProgram();
        gl::AttachShader(program, shader);
        gl::LinkProgram(program);
        gl::DeleteShader(shader);

        gl::GetProgramiv(program, gl::LINK_STATUS, &mut status);
        if status == 0 {
            let log = program_log(program);
            gl::DeleteProgram(program);
            return Err(InteropError::call("glLinkProgram", format!("{name}: {log}")));
        }
        check_gl("glLinkProgram")?;
        tracing::debug!(kernel = name, program, "compiled compute kernel");
        Ok(program)
    }
}

unsafe fn shader_log(shader: GLuint) -> String {
    let mut len: GLint = 0;
    gl::GetShaderiv(shader, gl::INFO_LOG_LENGTH, &mut len);
    let mut buf = vec![0u8; len.max(1) as usize];
    let mut written = 0;
    gl::GetShaderInfoLog(shader, len, &mut written, buf.as_mut_ptr() as *mut GLchar);
    buf.truncate(written.max(0) as usize);
    String::from_utf8_lossy(&buf).into_owned()
}

unsafe fn program_log(program: GLuint) -> String {
    let mut len: GLint = 0;
    gl::GetProgramiv(program, gl::INFO_LOG_LENGTH, &mut len);
    let mut buf = vec![0u8; len.max(1) as usize];
    let mut written = 0;
    gl::GetProgramInfoLog(program, len, &mut written, buf.as_mut_ptr() as *mut GLchar);
    buf.truncate(written.max(0) as usize);
    String::from_utf8_lossy(&buf).into_owned()
}
